use docmodel::{memory::InMemoryStore, prelude::*};

#[tokio::test]
async fn quick_start() {
    let schema = Schema::builder()
        .path("name", PathOptions::string().required(true).trim())
        .path("tags", PathOptions::array(SchemaType::String))
        .virtual_path(
            "label",
            VirtualPath::new().get(|node| match node.get("name") {
                Bson::String(name) => Bson::String(format!("<{}>", name)),
                _ => Bson::Undefined,
            }),
        )
        .options(SchemaOptions::default().id_virtual(false))
        .build()
        .unwrap();
    let users = Model::new("User", schema, InMemoryStore::new());

    let mut user = users.new_document(doc! { "name": "  Alice  " }).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.push("tags", ["admin"]).unwrap();
    assert_eq!(
        user.get_changes(),
        doc! { "$push": { "tags": { "$each": ["admin"] } } }
    );
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let json = user.to_json(ToObjectOptions::new().virtuals(true)).unwrap();
    assert_eq!(json["name"], serde_json::json!("Alice"));
    assert_eq!(json["label"], serde_json::json!("<Alice>"));
    assert_eq!(json["tags"], serde_json::json!(["admin"]));

    let loaded = users.find_by_id(user.id(), None).await.unwrap().unwrap();
    assert!(loaded.equals(&user));
}
