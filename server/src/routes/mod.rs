pub mod conversations;
pub mod identity;
pub mod messages;
pub mod pairing;
