pub mod ca;
pub mod issuer;
pub mod verify;
