use annals_macros::Payload;

#[derive(Payload)]
pub enum Nothing {}

fn main() {}
