pub mod hmac;

pub use hmac::ApiCredentials;
