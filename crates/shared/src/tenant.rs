//! Tenant scoping
//!
//! Every church-scoped record implements [`Tenantable`] so a single generic
//! check can verify that a record belongs to the church a request is acting for.

use uuid::Uuid;

use crate::error::StewardError;

/// A record owned by exactly one church (tenant).
pub trait Tenantable {
    fn tenant_id(&self) -> Uuid;
}

/// Verify that `record` belongs to `tenant_id`.
pub fn ensure_same_tenant<T: Tenantable + ?Sized>(
    record: &T,
    tenant_id: Uuid,
) -> Result<(), StewardError> {
    let actual = record.tenant_id();
    if actual != tenant_id {
        return Err(StewardError::TenantMismatch {
            expected: tenant_id,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note {
        church_id: Uuid,
    }

    impl Tenantable for Note {
        fn tenant_id(&self) -> Uuid {
            self.church_id
        }
    }

    #[test]
    fn test_same_tenant_passes() {
        let church_id = Uuid::new_v4();
        let note = Note { church_id };
        assert!(ensure_same_tenant(&note, church_id).is_ok());
    }

    #[test]
    fn test_other_tenant_rejected() {
        let note = Note {
            church_id: Uuid::new_v4(),
        };
        let expected = Uuid::new_v4();
        match ensure_same_tenant(&note, expected) {
            Err(StewardError::TenantMismatch { expected: e, actual }) => {
                assert_eq!(e, expected);
                assert_eq!(actual, note.church_id);
            }
            other => panic!("expected tenant mismatch, got {:?}", other),
        }
    }
}
