mod dns;
mod policy;
mod ranges;

pub use dns::{Resolver, TokioResolver, resolver_fn};
pub use policy::{AddressPolicy, AddressPolicyBuilder, BlockReason, DomainPattern};
pub use ranges::private_networks;
