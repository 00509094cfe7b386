pub mod id;

pub use id::random_hex;
