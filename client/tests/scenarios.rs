use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use client::app::{AppSettings, TicketingApp};
use client::attachments::AttachmentStore;
use client::catalog::event_scan;
use client::error::ClientError;
use client::inventory::PurchaseOrder;
use client::orchestrator::TxState;
use client::testutils::{FakeLedger, MemoryAttachmentStore, alice, bob, carol, fast_confirmations};
use client::validation::{TicketInput, ValidationFailure, ValidationOutcome};
use ticket_api::{Role, TicketRecord, TicketState, Wei};
use tokio_stream::StreamExt;
use wallet::ProviderNotification;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init()
        .ok();
}

struct World {
    fake: Arc<FakeLedger>,
    store: Arc<MemoryAttachmentStore>,
    app: Arc<TicketingApp>,
}

async fn world(account: ticket_api::Address) -> World {
    init_tracing();
    let fake = FakeLedger::new();
    fake.set_accounts(vec![account]);
    let store = Arc::new(MemoryAttachmentStore::default());
    let settings = AppSettings {
        confirmations: fast_confirmations(),
        ..AppSettings::default()
    };
    let app = TicketingApp::new(
        fake.clone(),
        fake.clone(),
        Some(store.clone() as Arc<dyn AttachmentStore>),
        settings,
    );
    app.connect().await.expect("connect");
    World { fake, store, app }
}

#[tokio::test]
async fn first_purchase_shows_up_as_one_valid_ticket() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_event("Opening Night", Wei::new(1000), true);
    assert!(w.app.my_tickets(0).await?.tickets.is_empty());

    let mut updates = w.app.orchestrator.subscribe();
    let tx = w.app.buy_tickets(1, 1).await?;
    assert_eq!(tx.state, TxState::Confirmed);

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update.state);
    }
    assert_eq!(
        seen,
        vec![
            TxState::Idle,
            TxState::AwaitingSignature,
            TxState::Submitted,
            TxState::Confirmed
        ]
    );

    let page = w.app.inventory.current().expect("page refreshed after purchase");
    assert_eq!(page.tickets.len(), 1);
    let ticket = &page.tickets[0];
    assert_eq!(ticket.event_id, 1);
    assert_eq!(ticket.state, TicketState::Valid);
    assert_eq!(ticket.purchase_price, Wei::new(1000));
    Ok(())
}

#[tokio::test]
async fn account_switch_discards_everything() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_event("Opening Night", Wei::new(1000), true);
    w.fake.mint_to(&alice(), 1, Wei::new(1000));
    w.fake.add_role_member(Role::Organizer, alice());
    let listener = w.app.spawn_notification_listener();

    w.app.load_events().await;
    w.app.my_tickets(0).await?;
    w.app.capabilities(None).await?;
    let mut snapshots = w.app.session.subscribe();

    w.fake.emit(ProviderNotification::AccountsChanged(vec![bob()]));
    snapshots
        .wait_for(|s| s.address.as_ref() == Some(&bob()))
        .await?;

    assert_eq!(w.app.session.address(), Some(bob()));
    assert!(!w.app.catalog.is_loaded());
    assert!(w.app.inventory.current().is_none());
    assert_eq!(w.app.roles.cached_membership(Role::Organizer, &alice()), None);

    assert!(w.app.my_tickets(0).await?.tickets.is_empty());
    assert!(w.app.capabilities(None).await?.is_empty());
    listener.abort();
    Ok(())
}

#[tokio::test]
async fn used_ticket_gets_the_specific_message() -> Result<()> {
    let w = world(carol()).await;
    w.fake.add_role_member(Role::Validator, carol());
    w.fake.put_ticket(
        &alice(),
        TicketRecord {
            id: 42,
            event_id: 1,
            state: TicketState::Used,
            purchase_price: Wei::new(1000),
        },
    );

    let outcome = w.app.validate(TicketInput::Manual("42".into())).await;
    assert_eq!(
        outcome,
        ValidationOutcome::Refused {
            ticket_id: Some(42),
            failure: ValidationFailure::AlreadyUsedOrInvalid,
        }
    );
    assert!(outcome.message().contains("already been used"));
    assert!(w.app.validation.input_enabled());
    assert_eq!(w.app.validation.last_state(), Some(TxState::Failed));
    Ok(())
}

#[tokio::test]
async fn validation_admits_once_then_refuses() -> Result<()> {
    let w = world(carol()).await;
    w.fake.add_role_member(Role::Validator, carol());
    let id = w.fake.mint_to(&alice(), 1, Wei::new(1000));

    let first = w.app.validate(TicketInput::Scanned(id.to_string())).await;
    assert!(first.is_admitted());
    assert_eq!(w.fake.ticket(id).map(|(_, t)| t.state), Some(TicketState::Used));

    let again = w.app.validate(TicketInput::Manual(id.to_string())).await;
    assert!(!again.is_admitted());

    let missing = w.app.validate(TicketInput::Manual("999".into())).await;
    assert!(matches!(
        missing,
        ValidationOutcome::Refused {
            failure: ValidationFailure::NotFound,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn validation_input_is_locked_while_submitted() -> Result<()> {
    let w = world(carol()).await;
    w.fake.add_role_member(Role::Validator, carol());
    let id = w.fake.mint_to(&alice(), 1, Wei::new(1000));
    w.fake.hold_receipts(true);

    let pending = {
        let app = w.app.clone();
        tokio::spawn(async move { app.validate(TicketInput::Manual(id.to_string())).await })
    };
    while w.app.validation.last_state() != Some(TxState::Submitted) {
        tokio::task::yield_now().await;
    }
    assert!(!w.app.validation.input_enabled());
    let blocked = w.app.validate(TicketInput::Manual(id.to_string())).await;
    assert!(matches!(
        blocked,
        ValidationOutcome::Refused {
            failure: ValidationFailure::Busy,
            ..
        }
    ));

    w.fake.hold_receipts(false);
    assert!(pending.await?.is_admitted());
    while !w.app.validation.input_enabled() {
        tokio::task::yield_now().await;
    }
    Ok(())
}

#[tokio::test]
async fn refunded_ticket_is_never_reported_valid() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_event("Opening Night", Wei::new(1000), true);
    w.app.buy_tickets(1, 2).await?;
    let page = w.app.my_tickets(0).await?;
    let target = page.tickets[0].id;

    w.app.refund_ticket(target).await?;

    let after = w.app.my_tickets(0).await?;
    assert!(after.valid_tickets().iter().all(|t| t.id != target));
    if let Some(t) = after.tickets.iter().find(|t| t.id == target) {
        assert_eq!(t.state, TicketState::Refunded);
    }
    assert_eq!(after.valid_tickets().len(), 1);
    Ok(())
}

#[tokio::test]
async fn second_refund_click_is_rejected_not_queued() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_event("Opening Night", Wei::new(1000), true);
    let id = w.fake.mint_to(&alice(), 1, Wei::new(1000));
    w.fake.hold_signatures(true);

    let first = w
        .app
        .orchestrator
        .submit(client::actions::WriteAction::refund(id)?)?;
    let second = w.app.refund_ticket(id).await;
    assert!(matches!(second, Err(ClientError::AlreadyInFlight(_))));

    w.fake.hold_signatures(false);
    assert_eq!(first.await?.state, TxState::Confirmed);
    Ok(())
}

#[tokio::test]
async fn batch_totals_are_exact_and_attachments_distinct() -> Result<()> {
    let w = world(alice()).await;
    let price = Wei::new(333_333_333_333_333_333);
    w.fake.add_event("Opening Night", price, true);

    for q in [1u64, 2, 7, 10] {
        let before = w.fake.balance();
        let stored_before = w.store.len();
        let tx = w.app.buy_tickets(1, q).await?;
        assert!(tx.is_confirmed());
        assert_eq!(w.store.len() - stored_before, q as usize);
        let paid = w.fake.balance().value() - before.value();
        assert_eq!(paid, price.value() * u128::from(q));

        if let client::actions::WriteAction::BuyTickets(order) = &tx.action {
            assert_eq!(order.quantity(), q);
            let distinct: HashSet<_> = order.attachments().iter().collect();
            assert_eq!(distinct.len() as u64, q);
        } else {
            panic!("unexpected action {:?}", tx.action);
        }
    }

    assert!(matches!(
        w.app.buy_tickets(1, 11).await,
        Err(ClientError::InvalidInput(_))
    ));
    let event = w.fake.event_record(1);
    assert!(PurchaseOrder::new(&event, 3, vec!["ipfs://one".into()]).is_err());
    Ok(())
}

#[tokio::test]
async fn discovery_stops_at_the_sentinel() -> Result<()> {
    let w = world(alice()).await;
    for name in ["A", "B", "C"] {
        w.fake.add_event(name, Wei::new(1), true);
    }
    let ids: Vec<u64> = event_scan(&w.app.gateway, 20)
        .map(|e| e.map(|e| e.id))
        .collect::<Result<Vec<_>, _>>()
        .await?;
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(w.fake.event_reads(), 4);
    Ok(())
}

#[tokio::test]
async fn organizer_flow_end_to_end() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_role_member(Role::Organizer, alice());

    w.app.create_event("Summer Festival", Wei::new(5000)).await?;
    assert_eq!(w.app.catalog.search("summer").len(), 1);

    w.app.toggle_event(1).await?;
    assert!(w.app.catalog.active().is_empty());
    assert_eq!(w.app.catalog.all().len(), 1);

    w.app.grant_role(Role::Validator, bob().as_str()).await?;
    assert_eq!(w.app.roles.cached_membership(Role::Validator, &bob()), Some(true));
    w.app.revoke_role(Role::Validator, bob().as_str()).await?;
    assert_eq!(w.app.roles.cached_membership(Role::Validator, &bob()), Some(false));

    w.app.withdraw_funds().await?;
    Ok(())
}

#[tokio::test]
async fn page_load_started_before_a_refund_cannot_undo_it() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_event("Opening Night", Wei::new(1000), true);
    let id = w.fake.mint_to(&alice(), 1, Wei::new(1000));
    w.app.my_tickets(0).await?;

    w.fake.stall_next_ticket_read();
    let older = {
        let app = w.app.clone();
        tokio::spawn(async move { app.my_tickets(0).await })
    };
    while w.fake.stalled_reads() == 0 {
        tokio::task::yield_now().await;
    }

    let tx = w.app.refund_ticket(id).await?;
    assert!(tx.is_confirmed());
    assert_eq!(tx.refresh_error, None);

    w.fake.release_stalled_reads();
    assert!(older.await?.is_err());
    let page = w.app.inventory.current().expect("page after refund");
    assert_eq!(page.tickets[0].state, TicketState::Refunded);
    assert!(w.app.inventory.valid_tickets().is_empty());
    Ok(())
}

#[tokio::test]
async fn scan_started_before_a_toggle_cannot_undo_it() -> Result<()> {
    let w = world(alice()).await;
    w.fake.add_role_member(Role::Organizer, alice());
    w.fake.add_event("Opening Night", Wei::new(1000), true);

    w.fake.stall_next_event_read();
    let older = {
        let app = w.app.clone();
        tokio::spawn(async move { app.load_events().await })
    };
    while w.fake.stalled_reads() == 0 {
        tokio::task::yield_now().await;
    }

    w.app.toggle_event(1).await?;
    assert!(w.app.catalog.active().is_empty());

    w.fake.release_stalled_reads();
    older.await?;
    assert!(w.app.catalog.active().is_empty());
    assert!(w.app.catalog.search("opening").is_empty());
    Ok(())
}
