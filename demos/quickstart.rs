//! Quickstart: append records for an entity and rebuild its state by replay.
//!
//! Run with: `cargo run --example quickstart`

use annals::{
    EventRecord, JsonSerializer, MetaData, Payload, backend::inmemory, store::EventStore,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, Payload)]
#[payload(name = "account")]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
pub struct Account {
    owner: String,
    balance: u64,
}

impl Account {
    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { owner } => owner.clone_into(&mut self.owner),
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = EventStore::new(inmemory::Backend::new(), JsonSerializer::default());
    let account_id = "account-1".to_string();

    let mut tx = store.begin(account_id.clone(), None);
    tx.append(AccountEvent::Opened {
        owner: "Ada".into(),
    })
    .append(AccountEvent::Deposited { amount: 100 })
    .append_with_metadata(
        AccountEvent::Withdrawn { amount: 30 },
        MetaData::empty().with("requested_by", "atm-17"),
    );
    let appended = tx.commit().await?;
    println!("Appended up to sequence {}", appended.last_sequence);

    let history: Vec<EventRecord<String, AccountEvent>> =
        store.read_stream(&account_id).try_collect().await?;

    let mut account = Account::default();
    for record in &history {
        let event = record.payload().materialize()?;
        println!(
            "  #{} {} {:?}",
            record.sequence_number(),
            record.payload().declared_type()?,
            record.metadata().get("requested_by")
        );
        account.apply(event);
    }

    println!("{} has a balance of {}", account.owner, account.balance);
    assert_eq!(account.balance, 70);
    Ok(())
}
