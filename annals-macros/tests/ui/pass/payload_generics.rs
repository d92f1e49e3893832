extern crate self as annals;

#[path = "../common.rs"]
mod support;

pub use support::{Payload, PayloadType, Saga};

use annals_macros::Payload;

#[derive(Payload)]
#[payload(name = "envelope")]
pub struct Envelope<T>
where
    T: Clone,
{
    pub inner: T,
}

fn main() {
    let envelope = Envelope { inner: 5_u8 };
    assert_eq!(envelope.payload_type().name(), "envelope");
    assert_eq!(<Envelope<String> as Payload>::TYPE_NAMES, &["envelope"]);
}
