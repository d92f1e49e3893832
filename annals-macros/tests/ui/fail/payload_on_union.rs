use annals_macros::Payload;

#[derive(Payload)]
pub union Bits {
    int: u32,
    float: f32,
}

fn main() {}
