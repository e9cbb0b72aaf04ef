//! Tenant-id syntax gate, the one piece of "authorization" this crate
//! still owns — end-user identity is verified upstream (bearer/JWT), but
//! every store-touching handler still checks
//! the tenant id is well-formed before it reaches a query.

use crate::models::domain::is_valid_tenant_id;
use crate::utils::error::ApiError;

pub struct DocumentAuthorization;

impl DocumentAuthorization {
    /// Rejects a malformed `tenant_id` before it reaches any store call.
    pub fn check_tenant_id(tenant_id: &str) -> Result<(), ApiError> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(ApiError::BadRequest(format!(
                "invalid tenant_id '{tenant_id}': expected [A-Za-z0-9_-]{{1,100}}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_separators() {
        assert!(DocumentAuthorization::check_tenant_id("a/b").is_err());
    }

    #[test]
    fn accepts_alnum_underscore_dash() {
        assert!(DocumentAuthorization::check_tenant_id("a_b-1").is_ok());
    }
}
