//! Full round trip over HTTP and the WebSocket gateway.

mod common;

use tokio::net::TcpListener;
use uuid::Uuid;

use switchboard_api::auth::create_token;
use switchboard_api::{AppState, AppStateInner, router};
use switchboard_client::config::ClientConfig;
use switchboard_client::{ClientContext, ClientError};
use switchboard_db::Database;
use switchboard_types::models::Role;

use common::eventually;

const SECRET: &str = "test-secret";

async fn serve() -> anyhow::Result<(AppState, String)> {
    let state = AppStateInner::new(Database::open_in_memory()?, SECRET.into());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((state, format!("http://{}", addr)))
}

async fn connect(
    base: &str,
    dir: &tempfile::TempDir,
    name: &str,
    role: Role,
) -> anyhow::Result<(Uuid, ClientContext)> {
    let id = Uuid::new_v4();
    let mut config = ClientConfig::new(base, create_token(SECRET, id, name, role)?);
    config.state_path = dir.path().join(format!("{}.json", id));
    let ctx = ClientContext::connect(config).await?;
    Ok((id, ctx))
}

#[tokio::test]
async fn hello_reaches_the_operator_and_reading_clears_it() -> anyhow::Result<()> {
    let (state, base) = serve().await?;
    let dir = tempfile::tempdir()?;

    let (_, operator) = connect(&base, &dir, "Desk", Role::Operator).await?;
    let (ada, end_user) = connect(&base, &dir, "Ada", Role::EndUser).await?;
    assert_eq!(end_user.viewer().user_id, ada);

    let stream = end_user.open_own_conversation().await?;
    let composer = end_user.composer(&stream);
    composer.set_input("Hello");
    let sent = composer.send().await?;

    let store = operator.conversations();
    eventually("operator counter at 1", || {
        store
            .for_end_user(ada)
            .is_some_and(|c| c.operator_unread_count == 1)
    })
    .await;

    let view = operator.open_conversation(stream.conversation_id()).await?;
    assert_eq!(view.entries().len(), 1);
    assert_eq!(view.entries()[0].body, "Hello");
    assert_eq!(operator.directory().display_name(sent.sender_id).await, "Ada");

    eventually("operator side read", || {
        state
            .db
            .get_conversation(stream.conversation_id())
            .ok()
            .flatten()
            .is_some_and(|c| c.operator_unread_count == 0)
    })
    .await;

    let reply = operator.composer(&view);
    reply.set_input("Hi Ada");
    reply.send().await?;
    eventually("reply on the end-user side", || stream.entries().len() == 2).await;
    Ok(())
}

#[tokio::test]
async fn a_row_written_right_after_opening_is_delivered() -> anyhow::Result<()> {
    let (_, base) = serve().await?;
    let dir = tempfile::tempdir()?;
    let (_, operator) = connect(&base, &dir, "Desk", Role::Operator).await?;
    let (ada, end_user) = connect(&base, &dir, "Ada", Role::EndUser).await?;

    let id = end_user.conversations().resolve_or_create(ada).await?.id;
    let mine = end_user.open_own_conversation().await?;
    let view = operator.open_conversation(id).await?;

    // No grace period: opening already waited for the gateway
    let composer = end_user.composer(&mine);
    composer.set_input("are you there?");
    composer.send().await?;

    eventually("message in the operator view", || view.entries().len() == 1).await;
    Ok(())
}

#[tokio::test]
async fn http_errors_map_onto_the_client_taxonomy() -> anyhow::Result<()> {
    let (_, base) = serve().await?;
    let dir = tempfile::tempdir()?;
    let (_, end_user) = connect(&base, &dir, "Ada", Role::EndUser).await?;

    let err = end_user
        .conversations()
        .resolve_or_create(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Forbidden));

    let err = end_user
        .conversations()
        .mark_read(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotFound));
    Ok(())
}

#[tokio::test]
async fn gateway_rejects_a_bad_token() -> anyhow::Result<()> {
    let (_, base) = serve().await?;
    let config = ClientConfig::new(&base, "not-a-token");
    assert!(ClientContext::connect(config).await.is_err());
    Ok(())
}
