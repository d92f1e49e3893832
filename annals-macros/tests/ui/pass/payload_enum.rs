extern crate self as annals;

#[path = "../common.rs"]
mod support;

pub use support::{Payload, PayloadType, Saga};

use annals_macros::Payload;

#[derive(Payload)]
#[payload(revision = "1")]
pub enum OrderEvent {
    Placed { order_id: String },
    #[payload(name = "order-cancelled")]
    Cancelled(String),
    Archived,
}

fn main() {
    assert_eq!(
        OrderEvent::TYPE_NAMES,
        &["order-event.placed", "order-cancelled", "order-event.archived"]
    );

    let placed = OrderEvent::Placed {
        order_id: "42".into(),
    };
    assert_eq!(placed.payload_type().name(), "order-event.placed");
    assert_eq!(placed.payload_type().revision(), Some("1"));
    assert_eq!(
        OrderEvent::Cancelled("42".into()).payload_type().name(),
        "order-cancelled"
    );
    assert_eq!(OrderEvent::Archived.payload_type().name(), "order-event.archived");
}
