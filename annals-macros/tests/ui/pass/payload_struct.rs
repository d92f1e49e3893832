extern crate self as annals;

#[path = "../common.rs"]
mod support;

pub use support::{Payload, PayloadType, Saga};

use annals_macros::Payload;

#[derive(Payload)]
pub struct OrderPlaced {
    pub order_id: String,
}

#[derive(Payload)]
#[payload(name = "order-created", revision = "2")]
pub struct LegacyOrderPlaced;

fn main() {
    let placed = OrderPlaced {
        order_id: "42".into(),
    };
    assert_eq!(OrderPlaced::TYPE_NAMES, &["order-placed"]);
    assert_eq!(placed.payload_type().name(), "order-placed");
    assert_eq!(placed.payload_type().revision(), None);

    assert_eq!(LegacyOrderPlaced.payload_type().name(), "order-created");
    assert_eq!(LegacyOrderPlaced.payload_type().revision(), Some("2"));
}
