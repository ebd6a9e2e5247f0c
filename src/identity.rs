//! Application identity generation.

/// Produces the identity of a consumer application instance when the
/// caller does not supply one.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random v4 UUID per instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdentity;

impl IdentityGenerator for UuidIdentity {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

impl<F> IdentityGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_identity_is_unique() {
        let generator = UuidIdentity;
        assert_ne!(generator.generate(), generator.generate());
    }

    #[test]
    fn test_closure_identity() {
        let generator = || "fixed".to_string();
        assert_eq!(generator.generate(), "fixed");
    }
}
