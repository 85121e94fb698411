use crate::auth::authorizer::OBJECT_WILDCARD;
use crate::auth::{AuthError, Authorizer};
use std::path::Path;
use std::{fs, io};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    subject: String,
    object: String,
    action: String,
}

impl Rule {
    fn permits(&self, subject: &str, object: &str, action: &str) -> bool {
        self.subject == subject && (self.object == OBJECT_WILDCARD || self.object == object) && self.action == action
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy: {0}")]
    Io(#[from] io::Error),
    #[error("malformed policy line {line}: {content:?}")]
    Malformed { line: usize, content: String },
}

/// AclAuthorizer allows exactly what its rules list and denies everything else.
///
/// Policy text has one rule per line, `p, <subject>, <object>, <action>`. Blank lines and lines
/// starting with `#` are skipped. An object of `*` matches any object.
#[derive(Debug, Clone, Default)]
pub struct AclAuthorizer {
    rules: Vec<Rule>,
}

impl AclAuthorizer {
    pub fn new() -> Self {
        AclAuthorizer::default()
    }

    pub fn allow(mut self, subject: impl Into<String>, object: impl Into<String>, action: impl Into<String>) -> Self {
        self.rules.push(Rule {
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
        });
        self
    }

    pub fn from_policy(policy: &str) -> Result<Self, PolicyError> {
        let mut authorizer = AclAuthorizer::new();

        for (i, raw) in policy.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, object, action] if !subject.is_empty() && !object.is_empty() && !action.is_empty() => {
                    authorizer = authorizer.allow(*subject, *object, *action);
                }
                _ => {
                    return Err(PolicyError::Malformed {
                        line: i + 1,
                        content: raw.to_string(),
                    })
                }
            }
        }

        Ok(authorizer)
    }

    pub fn from_policy_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        AclAuthorizer::from_policy(&fs::read_to_string(path)?)
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError> {
        if self.rules.iter().any(|rule| rule.permits(subject, object, action)) {
            Ok(())
        } else {
            Err(AuthError::forbidden(subject, object, action))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CONSUME_ACTION, PRODUCE_ACTION};

    const POLICY: &str = "
# root can do anything, nobody can only read
p, root, *, produce
p, root, *, consume
p, nobody, *, consume
";

    #[test]
    fn policy_allows_listed_rules() {
        let acl = AclAuthorizer::from_policy(POLICY).unwrap();

        assert!(acl.authorize("root", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
        assert!(acl.authorize("root", OBJECT_WILDCARD, CONSUME_ACTION).is_ok());
        assert!(acl.authorize("nobody", OBJECT_WILDCARD, CONSUME_ACTION).is_ok());
    }

    #[test]
    fn everything_else_is_denied() {
        let acl = AclAuthorizer::from_policy(POLICY).unwrap();

        let err = acl.authorize("nobody", OBJECT_WILDCARD, PRODUCE_ACTION).unwrap_err();
        assert_eq!(
            err.to_string(),
            "forbidden: subject nobody, object *, action produce"
        );
        assert!(acl.authorize("", OBJECT_WILDCARD, CONSUME_ACTION).is_err());
    }

    #[test]
    fn specific_objects_only_match_themselves() {
        let acl = AclAuthorizer::new().allow("alice", "orders", "consume");

        assert!(acl.authorize("alice", "orders", "consume").is_ok());
        assert!(acl.authorize("alice", "payments", "consume").is_err());
    }

    #[test]
    fn malformed_line_is_reported() {
        let err = AclAuthorizer::from_policy("p, root, *, produce\ng, root, admin\n").unwrap_err();
        match err {
            PolicyError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[test]
    fn reads_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        fs::write(&path, POLICY).unwrap();

        let acl = AclAuthorizer::from_policy_file(&path).unwrap();
        assert!(acl.authorize("root", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
    }
}
