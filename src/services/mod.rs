pub mod audit;
pub mod bookings;
pub mod charges;
pub mod payment_timeline;
pub mod rent_lifecycle;
pub mod rent_store;
pub mod stripe;
pub mod webhooks;
