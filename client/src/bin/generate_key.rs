use rand::distr::{Alphanumeric, SampleString};

const KEY_LEN: usize = 32;

#[expect(clippy::print_stdout, reason = "the key is the program's output")]
fn main() {
    println!("{}", Alphanumeric.sample_string(&mut rand::rng(), KEY_LEN));
}
