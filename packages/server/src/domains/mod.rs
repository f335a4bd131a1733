// Business domains
pub mod listings;
pub mod stores;
pub mod tenants;

pub use listings::{Listing, ListingStatus};
pub use stores::{Platform, SealedCredentials, Store};
pub use tenants::Tenant;
