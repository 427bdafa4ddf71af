use std::sync::Arc;

use bson::{Bson, doc};

use docmodel_core::{
    document::Document,
    error::DocumentError,
    model::{Model, SaveOptions},
    schema::{HookPoint, PathOptions, Schema, SchemaOptions, SchemaType, Timestamps},
    selection::Selection,
    serialize::ToObjectOptions,
};
use docmodel_memory::InMemoryStore;

fn user_schema() -> Arc<Schema> {
    Schema::builder()
        .path("name", PathOptions::string().required(true))
        .path("email", PathOptions::string().lowercase())
        .path("tags", PathOptions::array(SchemaType::String))
        .path("profile.age", PathOptions::number().min(0))
        .options(SchemaOptions::default().timestamps(Timestamps::new(
            Some("meta.created"),
            Some("meta.updated"),
        )))
        .build()
        .unwrap()
}

fn users(store: &InMemoryStore) -> Model<InMemoryStore> {
    Model::new("User", user_schema(), store.clone())
}

async fn reload(model: &Model<InMemoryStore>, doc: &Document) -> Document {
    model.find_by_id(doc.id(), None).await.unwrap().unwrap()
}

fn plain(doc: &Document) -> bson::Document {
    doc.to_object(ToObjectOptions::new()).unwrap()
}

#[tokio::test]
async fn saved_documents_reload_unchanged() {
    let store = InMemoryStore::new();
    let users = users(&store);

    let mut user = users
        .new_document(doc! { "name": "Ann", "email": "ANN@X.IO", "tags": ["a"], "profile": { "age": "30" } })
        .unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    assert!(!user.is_new());
    assert!(matches!(user.get("meta.created"), Bson::DateTime(_)));
    assert_eq!(user.get("meta.created"), user.get("meta.updated"));
    assert_eq!(store.records("users").await.len(), 1);

    let loaded = reload(&users, &user).await;
    assert!(!loaded.is_new());
    assert_eq!(loaded.get("email"), Bson::String("ann@x.io".into()));
    assert_eq!(plain(&loaded), plain(&user));
    assert!(loaded.equals(&user));
}

#[tokio::test]
async fn updates_apply_array_operations() {
    let store = InMemoryStore::new();
    let users = users(&store);
    let mut user = users.new_document(doc! { "name": "Ann", "tags": ["b", "c"] }).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.push_at("tags", 0, ["a"]).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.add_to_set("tags", ["a", "d"]).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.pull("tags", ["b"]).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.shift("tags").unwrap();
    user.set("profile.age", 41).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let loaded = reload(&users, &user).await;
    assert_eq!(
        loaded.get("tags"),
        Bson::Array(vec![Bson::String("c".into()), Bson::String("d".into())])
    );
    assert_eq!(loaded.get("profile.age"), Bson::Double(41.0));
    assert_eq!(plain(&loaded), plain(&user));
}

#[tokio::test]
async fn inserts_past_either_end_are_persisted() {
    let store = InMemoryStore::new();
    let users = users(&store);

    for (position, expected) in [(5, ["a", "b", "z"]), (-5, ["z", "a", "b"])] {
        let mut user = users.new_document(doc! { "name": "Ann", "tags": ["a", "b"] }).unwrap();
        users.save(&mut user, SaveOptions::default()).await.unwrap();

        user.push_at("tags", position, ["z"]).unwrap();
        let in_memory = user.get("tags");
        assert_eq!(in_memory, Bson::Array(expected.iter().map(|tag| Bson::from(*tag)).collect()));
        users.save(&mut user, SaveOptions::default()).await.unwrap();

        let loaded = reload(&users, &user).await;
        assert_eq!(loaded.get("tags"), in_memory);
    }
}

#[tokio::test]
async fn ignored_paths_are_not_persisted() {
    let store = InMemoryStore::new();
    let users = users(&store);
    let mut user = users.new_document(doc! { "name": "Ann" }).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    user.set("name", Bson::Null).unwrap();
    user.ignore("name");
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let loaded = reload(&users, &user).await;
    assert_eq!(loaded.get("name"), Bson::String("Ann".into()));
}

#[tokio::test]
async fn invalid_documents_stay_unsaved() {
    let store = InMemoryStore::new();
    let users = users(&store);
    let mut user = users.new_document(doc! { "profile": { "age": -1 } }).unwrap();

    let err = users.save(&mut user, SaveOptions::default()).await.unwrap_err();
    let err = err.as_validation().unwrap();
    assert_eq!(err.paths().collect::<Vec<_>>(), vec!["name", "profile.age"]);
    assert!(store.records("users").await.is_empty());
    assert!(user.is_new());
}

#[tokio::test]
async fn vanished_records_are_not_found() {
    let store = InMemoryStore::new();
    let users = users(&store);
    let mut user = users.new_document(doc! { "name": "Ann" }).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let mut stale = reload(&users, &user).await;
    users.remove(&mut user).await.unwrap();

    let err = users
        .save(&mut stale, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(&err, DocumentError::DocumentNotFound { model, .. } if model == "User"));
    assert!(err.to_string().contains("on model \"User\""));

    stale.set("name", "Bea").unwrap();
    let err = users
        .save(&mut stale, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::DocumentNotFound { .. }));
}

#[tokio::test]
async fn forced_inserts_report_duplicate_keys() {
    let store = InMemoryStore::builder().unique("users", "email").build();
    let users = users(&store);
    let mut user = users.new_document(doc! { "name": "Ann", "email": "a@x.io" }).unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let mut copy = reload(&users, &user).await;
    let options = SaveOptions {
        force_insert: true,
        ..SaveOptions::default()
    };
    let err = users.save(&mut copy, options).await.unwrap_err();
    assert!(matches!(&err, DocumentError::DuplicateKey { collection, .. } if collection == "users"));

    let mut other = users.new_document(doc! { "name": "Bea", "email": "A@X.IO" }).unwrap();
    let err = users.save(&mut other, SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, DocumentError::DuplicateKey { .. }));
    assert_eq!(store.records("users").await.len(), 1);
}

#[tokio::test]
async fn save_hooks_wrap_the_write() {
    let schema = Schema::builder()
        .path("title", PathOptions::string())
        .path("slug", PathOptions::string())
        .pre(HookPoint::Save, |doc: &mut Document| match doc.get("title") {
            Bson::String(title) if title.is_empty() => Err("title is empty".into()),
            Bson::String(title) => doc
                .set("slug", title.to_lowercase().replace(' ', "-"))
                .map_err(|err| err.to_string()),
            _ => Ok(()),
        })
        .build()
        .unwrap();
    let store = InMemoryStore::new();
    let posts = Model::new("Post", schema, store.clone());
    assert_eq!(posts.collection(), "posts");

    let mut post = posts.new_document(doc! { "title": "Hello World" }).unwrap();
    posts.save(&mut post, SaveOptions::default()).await.unwrap();
    let records = store.records("posts").await;
    assert_eq!(records[0].get_str("slug").unwrap(), "hello-world");

    let mut empty = posts.new_document(doc! { "title": "" }).unwrap();
    let err = posts.save(&mut empty, SaveOptions::default()).await.unwrap_err();
    assert!(matches!(err, DocumentError::Hook { .. }));
    assert_eq!(store.records("posts").await.len(), 1);
}

#[tokio::test]
async fn selections_limit_what_is_loaded() {
    let store = InMemoryStore::new();
    let users = users(&store);
    let mut user = users
        .new_document(doc! { "name": "Ann", "email": "a@x.io", "profile": { "age": 3 } })
        .unwrap();
    users.save(&mut user, SaveOptions::default()).await.unwrap();

    let mut partial = users
        .find_by_id(user.id(), Some(Selection::include(["profile.age"])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.get("name"), Bson::Undefined);
    assert_eq!(partial.get("profile.age"), Bson::Double(3.0));

    partial.set("profile.age", 4).unwrap();
    users.save(&mut partial, SaveOptions::default()).await.unwrap();

    let loaded = reload(&users, &user).await;
    assert_eq!(loaded.get("name"), Bson::String("Ann".into()));
    assert_eq!(loaded.get("profile.age"), Bson::Double(4.0));
}
