use secagent::chat::{ChatMessage, ChatSettings};
use secagent::constants::{DEFAULT_CHAT_TITLE, MAX_CHATS};
use secagent::session::MessageSink;
use secagent::store::{ChatHistorySink, ChatStore, StoreEvent};
use secagent::RelayError;
use tempfile::TempDir;

async fn open_store() -> (TempDir, ChatStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ChatStore::open(dir.path().join("chats.db")).await.unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_new_chats_list_newest_first_and_become_current() {
    let (_dir, store) = open_store().await;
    let settings = ChatSettings::default();

    let first = store.create_chat(None, &settings).await.unwrap();
    let second = store.create_chat(Some("  Apple 10-K  "), &settings).await.unwrap();

    assert_eq!(first.title, DEFAULT_CHAT_TITLE);
    assert_eq!(second.title, "Apple 10-K");

    let ids: Vec<String> = store
        .list_chats()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);
    assert_eq!(store.current_chat_id().await.unwrap(), Some(second.id.clone()));

    store.select_chat(Some(&first.id)).await.unwrap();
    let current = store.current_chat().await.unwrap().unwrap();
    assert_eq!(current.id, first.id);
}

#[tokio::test]
async fn test_history_is_capped() {
    let (_dir, store) = open_store().await;
    let settings = ChatSettings::default();

    let mut created = Vec::new();
    for _ in 0..(MAX_CHATS + 2) {
        created.push(store.create_chat(None, &settings).await.unwrap().id);
    }

    let listed: Vec<String> = store
        .list_chats()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(listed.len() as i64, MAX_CHATS);
    assert!(!listed.contains(&created[0]));
    assert!(!listed.contains(&created[1]));
    assert_eq!(listed[0], created[created.len() - 1]);
}

#[tokio::test]
async fn test_deleting_current_chat_falls_back_to_newest() {
    let (_dir, store) = open_store().await;
    let settings = ChatSettings::default();

    let older = store.create_chat(None, &settings).await.unwrap();
    let newer = store.create_chat(None, &settings).await.unwrap();
    assert_eq!(store.current_chat_id().await.unwrap(), Some(newer.id.clone()));

    assert!(store.delete_chat(&newer.id).await.unwrap());
    assert_eq!(store.current_chat_id().await.unwrap(), Some(older.id.clone()));

    assert!(store.delete_chat(&older.id).await.unwrap());
    assert_eq!(store.current_chat_id().await.unwrap(), None);
    assert!(store.list_chats().await.unwrap().is_empty());

    assert!(!store.delete_chat("missing").await.unwrap());
}

#[tokio::test]
async fn test_deleting_another_chat_keeps_current() {
    let (_dir, store) = open_store().await;
    let settings = ChatSettings::default();

    let older = store.create_chat(None, &settings).await.unwrap();
    let newer = store.create_chat(None, &settings).await.unwrap();

    assert!(store.delete_chat(&older.id).await.unwrap());
    assert_eq!(store.current_chat_id().await.unwrap(), Some(newer.id));
}

#[tokio::test]
async fn test_subscribers_see_changes() {
    let (_dir, store) = open_store().await;
    let mut events = store.subscribe();

    let chat = store.create_chat(None, &ChatSettings::default()).await.unwrap();
    assert_eq!(events.try_recv().unwrap(), StoreEvent::Created(chat.id.clone()));
    assert_eq!(
        events.try_recv().unwrap(),
        StoreEvent::CurrentChanged(Some(chat.id.clone()))
    );

    store
        .update_chat(&chat.id, &[ChatMessage::user("hi")], None)
        .await
        .unwrap();
    assert_eq!(events.try_recv().unwrap(), StoreEvent::Updated(chat.id.clone()));

    store.delete_chat(&chat.id).await.unwrap();
    assert_eq!(events.try_recv().unwrap(), StoreEvent::Deleted(chat.id.clone()));
    assert_eq!(events.try_recv().unwrap(), StoreEvent::CurrentChanged(None));
}

#[tokio::test]
async fn test_messages_and_settings_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chats.db");

    let chat_id = {
        let store = ChatStore::open(&path).await.unwrap();
        let chat = store.create_chat(None, &ChatSettings::default()).await.unwrap();
        let messages = vec![
            ChatMessage::user("What did Apple report?"),
            ChatMessage::assistant("a1", "Revenue grew.", None),
        ];
        store.update_chat(&chat.id, &messages, None).await.unwrap();
        let settings = ChatSettings {
            stock_ticker: Some("AAPL".to_string()),
            ..Default::default()
        };
        store.update_settings(&chat.id, &settings).await.unwrap();
        chat.id
    };

    let store = ChatStore::open(&path).await.unwrap();
    let chat = store.get_chat(&chat_id).await.unwrap().unwrap();
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[1].content, "Revenue grew.");
    assert_eq!(chat.settings.ticker(), Some("AAPL"));
    assert!(chat.updated_at >= chat.created_at);
}

#[tokio::test]
async fn test_updating_a_missing_chat_fails() {
    let (_dir, store) = open_store().await;

    let err = store.update_chat("missing", &[], None).await.unwrap_err();
    assert!(matches!(err.inner, RelayError::Validation(_)));
}

#[tokio::test]
async fn test_history_sink_titles_from_first_message() {
    let (_dir, store) = open_store().await;
    let chat = store.create_chat(None, &ChatSettings::default()).await.unwrap();
    let mut sink = ChatHistorySink::new(store.clone(), &chat);

    let question = ChatMessage::user("What was Apple's revenue in fiscal 2023 overall?");
    sink.messages_changed(std::slice::from_ref(&question))
        .await
        .unwrap();
    assert_eq!(sink.title(), "What was Apple's revenue in fiscal...");

    let answer = ChatMessage::assistant("a1", "About $383B.", None);
    sink.messages_changed(&[question, answer]).await.unwrap();

    let stored = store.get_chat(sink.chat_id()).await.unwrap().unwrap();
    assert_eq!(stored.title, "What was Apple's revenue in fiscal...");
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn test_history_sink_keeps_existing_title() {
    let (_dir, store) = open_store().await;
    let chat = store
        .create_chat(Some("Risk factors"), &ChatSettings::default())
        .await
        .unwrap();
    let mut sink = ChatHistorySink::new(store.clone(), &chat);

    let messages = vec![
        ChatMessage::user("first"),
        ChatMessage::assistant("a1", "reply", None),
        ChatMessage::user("second"),
    ];
    sink.messages_changed(&messages).await.unwrap();
    assert_eq!(sink.title(), "Risk factors");

    // Clearing the chat leaves the title alone.
    sink.messages_changed(&[]).await.unwrap();
    let stored = store.get_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Risk factors");
    assert!(stored.messages.is_empty());
}
