mod acl;
mod authorizer;

pub use acl::AclAuthorizer;
pub use acl::PolicyError;
pub use authorizer::AllowAll;
pub use authorizer::AuthError;
pub use authorizer::Authorizer;
pub use authorizer::CONSUME_ACTION;
pub use authorizer::OBJECT_WILDCARD;
pub use authorizer::PRODUCE_ACTION;
