pub mod browsed;
pub mod cdp;
pub mod direct;
pub mod gate;
pub mod proxy;
pub mod session;
pub mod solver;

pub use browsed::BrowsedPool;
pub use direct::DirectPool;
