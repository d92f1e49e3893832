extern crate self as annals;

#[path = "../common.rs"]
mod support;

pub use support::{Payload, PayloadType, Saga};

use annals_macros::Saga;

#[derive(Saga)]
pub struct OrderSaga;

#[derive(Saga)]
#[saga(kind = "shipping")]
pub struct ShippingSaga {
    pub tracking: String,
}

fn main() {
    assert_eq!(OrderSaga::KIND, "order-saga");
    assert_eq!(ShippingSaga::KIND, "shipping");
}
