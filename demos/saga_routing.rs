//! Saga routing: sagas register associations, inbound events are routed to
//! every saga whose associations match, and finished sagas stop receiving
//! events.
//!
//! Run with: `cargo run --example saga_routing`

use std::collections::HashMap;

use annals::{AssociationIndex, InvalidAssociation, Saga};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Saga)]
#[saga(kind = "order-fulfilment")]
pub struct OrderFulfilment {
    shipped: bool,
    paid: bool,
}

#[derive(Debug)]
pub enum Inbound {
    PaymentReceived { order_id: String },
    ParcelShipped { order_id: String, parcel: String },
    ParcelDelivered { parcel: String },
}

impl Inbound {
    /// The association an event is routed by.
    fn routing_key(&self) -> (&'static str, &str) {
        match self {
            Self::PaymentReceived { order_id } | Self::ParcelShipped { order_id, .. } => {
                ("orderId", order_id.as_str())
            }
            Self::ParcelDelivered { parcel } => ("parcelId", parcel.as_str()),
        }
    }
}

/// Owns the saga instances and the index used to route events to them.
#[derive(Default)]
struct Dispatcher {
    index: AssociationIndex<u32>,
    sagas: HashMap<u32, OrderFulfilment>,
    next_id: u32,
}

impl Dispatcher {
    fn start(&mut self, order_id: &str) -> Result<u32, InvalidAssociation> {
        self.next_id += 1;
        let id = self.next_id;
        self.index.add(OrderFulfilment::KIND, id);
        self.index.associate(&id, "orderId", order_id)?;
        self.sagas.insert(id, OrderFulfilment::default());
        Ok(id)
    }

    fn dispatch(&mut self, event: &Inbound) -> Result<usize, InvalidAssociation> {
        let (key, value) = event.routing_key();
        let targets = self.index.find(OrderFulfilment::KIND, key, value);
        for id in &targets {
            let Some(saga) = self.sagas.get_mut(id) else {
                continue;
            };
            match event {
                Inbound::PaymentReceived { .. } => saga.paid = true,
                Inbound::ParcelShipped { parcel, .. } => {
                    saga.shipped = true;
                    self.index.associate(id, "parcelId", parcel.as_str())?;
                }
                Inbound::ParcelDelivered { .. } if saga.paid && saga.shipped => {
                    println!("  saga {id} complete");
                    self.sagas.remove(id);
                    self.index.remove(id);
                }
                Inbound::ParcelDelivered { .. } => {}
            }
        }
        Ok(targets.len())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut dispatcher = Dispatcher::default();
    dispatcher.start("order-1")?;
    dispatcher.start("order-2")?;

    let events = [
        Inbound::PaymentReceived {
            order_id: "order-1".into(),
        },
        Inbound::ParcelShipped {
            order_id: "order-1".into(),
            parcel: "p-99".into(),
        },
        Inbound::ParcelDelivered {
            parcel: "p-99".into(),
        },
        Inbound::PaymentReceived {
            order_id: "order-1".into(),
        },
    ];
    for event in &events {
        let routed = dispatcher.dispatch(event)?;
        println!("{event:?} -> {routed} saga(s)");
    }

    println!(
        "Active {} sagas: {}",
        OrderFulfilment::KIND,
        dispatcher.index.count(OrderFulfilment::KIND)
    );
    assert_eq!(dispatcher.index.count(OrderFulfilment::KIND), 1);
    Ok(())
}
