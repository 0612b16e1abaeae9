//! API request and response models.

use serde::{Deserialize, Serialize};

/// Query parameters for GET /umbra/encode and GET /umbra/decode.
#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    /// A destination URL (encode) or a relay address (decode).
    pub url: String,
}

/// Response body for the addressing endpoints.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressResponse {
    /// Real destination URL.
    pub url: String,
    /// Relay-addressable path for `url`.
    pub proxied: String,
}
