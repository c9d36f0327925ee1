//! Extraction of the authenticated principal.
//!
//! Authentication happens upstream. The gateway forwards the verified
//! identity in request headers:
//!
//! | header              | content                                   |
//! |---------------------|-------------------------------------------|
//! | `x-user-id`         | numeric account id                        |
//! | `x-user-role`       | `customer`, `vendor`, `driver` or `admin` |
//! | `x-restaurant-ids`  | comma separated ids managed by a vendor   |
//! | `x-driver-available`| `true` when a driver is accepting orders  |

use axum::{extract::FromRequestParts, http::request::Parts};
use dispatch_types::{APIError, Principal, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const RESTAURANT_IDS_HEADER: &str = "x-restaurant-ids";
pub const DRIVER_AVAILABLE_HEADER: &str = "x-driver-available";

/// The principal a request acts as.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal(pub Principal);

impl<S> FromRequestParts<S> for AuthenticatedPrincipal
where
	S: Send + Sync,
{
	type Rejection = APIError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let id = header(parts, USER_ID_HEADER)
			.ok_or_else(|| unauthorized("missing x-user-id header"))?
			.parse::<i64>()
			.map_err(|_| unauthorized("x-user-id must be an integer"))?;
		let role = header(parts, USER_ROLE_HEADER)
			.ok_or_else(|| unauthorized("missing x-user-role header"))?
			.parse::<Role>()
			.map_err(unauthorized)?;

		let restaurant_ids = match header(parts, RESTAURANT_IDS_HEADER) {
			Some(raw) => raw
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(|s| s.parse::<i64>())
				.collect::<Result<Vec<_>, _>>()
				.map_err(|_| unauthorized("x-restaurant-ids must be a list of integers"))?,
			None => Vec::new(),
		};
		let available = header(parts, DRIVER_AVAILABLE_HEADER)
			.is_some_and(|value| value.eq_ignore_ascii_case("true"));

		Ok(AuthenticatedPrincipal(Principal {
			id,
			role,
			restaurant_ids,
			available,
		}))
	}
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
	parts.headers.get(name).and_then(|value| value.to_str().ok())
}

fn unauthorized(message: impl Into<String>) -> APIError {
	APIError::Unauthorized {
		message: message.into(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::Request;

	async fn extract(request: Request<()>) -> Result<AuthenticatedPrincipal, APIError> {
		let (mut parts, _) = request.into_parts();
		AuthenticatedPrincipal::from_request_parts(&mut parts, &()).await
	}

	#[tokio::test]
	async fn test_vendor_headers() {
		let request = Request::builder()
			.header(USER_ID_HEADER, "200")
			.header(USER_ROLE_HEADER, "Vendor")
			.header(RESTAURANT_IDS_HEADER, "7, 8")
			.body(())
			.unwrap();

		let AuthenticatedPrincipal(principal) = tokio_test::assert_ok!(extract(request).await);
		assert_eq!(principal.role, Role::Vendor);
		assert_eq!(principal.restaurant_ids, vec![7, 8]);
		assert!(!principal.available);
	}

	#[tokio::test]
	async fn test_missing_identity_is_unauthorized() {
		let request = Request::builder()
			.header(USER_ROLE_HEADER, "driver")
			.body(())
			.unwrap();

		let err = tokio_test::assert_err!(extract(request).await);
		assert_eq!(err.status_code(), 401);
	}

	#[tokio::test]
	async fn test_unknown_role_is_unauthorized() {
		let request = Request::builder()
			.header(USER_ID_HEADER, "5")
			.header(USER_ROLE_HEADER, "courier")
			.body(())
			.unwrap();

		assert!(matches!(
			extract(request).await,
			Err(APIError::Unauthorized { .. })
		));
	}
}
