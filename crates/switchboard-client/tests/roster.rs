mod common;

use switchboard_client::ClientError;
use switchboard_client::backend::Backend;
use switchboard_types::models::Role;

use common::{Server, eventually};

#[tokio::test]
async fn roster_lists_every_end_user_with_unread_first() {
    let server = Server::new();
    let op = server.user("Desk", Role::Operator);
    let ada = server.user("Ada", Role::EndUser);
    let bo = server.user("Bo", Role::EndUser);
    let cy = server.user("Cy", Role::EndUser);
    let operator = server.client(&op).await;

    // Bo has written, Cy was contacted and answered, Ada never talked
    let bo_client = server.client(&bo).await;
    let bo_conv = bo_client.ctx.conversations().resolve_or_create(bo.sub).await.unwrap();
    bo_client.backend.send_message(bo_conv.id, "help").await.unwrap();

    let cy_conv = operator.ctx.conversations().resolve_or_create(cy.sub).await.unwrap();
    operator.backend.send_message(cy_conv.id, "hi Cy").await.unwrap();

    let roster = operator.ctx.roster().unwrap();
    let entries = roster.load().await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.user.display_name.as_str()).collect();
    assert_eq!(names, vec!["Bo", "Cy", "Ada"]);
    assert_eq!(entries[0].operator_unread(), 1);
    assert!(entries[2].conversation.is_none());

    // Directory is seeded from the listing
    assert_eq!(operator.ctx.directory().display_name(ada.sub).await, "Ada");
}

#[tokio::test]
async fn picking_an_uncontacted_user_creates_their_conversation() {
    let server = Server::new();
    let op = server.user("Desk", Role::Operator);
    let ada = server.user("Ada", Role::EndUser);
    let operator = server.client(&op).await;

    let stream = operator.ctx.open_for_end_user(ada.sub).await.unwrap();
    let composer = operator.ctx.composer(&stream);
    composer.set_input("Hi Ada, anything we can help with?");
    composer.send().await.unwrap();

    let store = operator.ctx.conversations();
    eventually("conversation in the store", || {
        store.for_end_user(ada.sub).map(|c| c.id) == Some(stream.conversation_id())
    })
    .await;

    // Picking again opens the same one
    let again = operator.ctx.roster().unwrap().select_or_create(ada.sub).await.unwrap();
    assert_eq!(again.id, stream.conversation_id());

    // Ada sees it waiting for her
    let end_user = server.client(&ada).await;
    let mine = end_user.ctx.conversations();
    assert_eq!(mine.for_end_user(ada.sub).map(|c| c.end_user_unread_count), Some(1));
    assert!(mine.has_unread());
}

#[tokio::test]
async fn roster_is_operator_only() {
    let server = Server::new();
    let ada = server.user("Ada", Role::EndUser);
    let end_user = server.client(&ada).await;

    assert!(matches!(end_user.ctx.roster(), Err(ClientError::Forbidden)));
    assert!(matches!(
        end_user.ctx.conversations().list_for_operator().await,
        Err(ClientError::Forbidden)
    ));
}
