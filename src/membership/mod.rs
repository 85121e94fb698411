mod member;
#[allow(clippy::module_inception)]
mod membership;

pub use member::Member;
pub use member::MemberStatus;
pub use member::MembershipEvent;
pub use member::RPC_ADDR_TAG;
pub use membership::Handler;
pub use membership::HandlerError;
pub use membership::Membership;
pub use membership::MembershipConfig;
pub use membership::MembershipError;
