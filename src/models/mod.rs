pub mod events;
pub mod geo;
pub mod position;
pub mod preparation;
pub mod routing;
