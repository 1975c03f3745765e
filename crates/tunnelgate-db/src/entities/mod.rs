//! Database entities

pub mod peer;
pub mod setting;
pub mod tunnel;

pub use peer::Entity as Peer;
pub use setting::Entity as Setting;
pub use tunnel::Entity as Tunnel;

pub mod prelude {
    pub use super::peer::Entity as Peer;
    pub use super::setting::Entity as Setting;
    pub use super::tunnel::Entity as Tunnel;
}
