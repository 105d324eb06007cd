use futures_util::future::LocalBoxFuture;

use crate::AnyResult;

/// Public key used to validate domain ownership on development nodes.
pub const DEV_DOMAIN_PUBLIC_KEY: &[u8] = b"-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEr2zLwKGpFYl6zDZcjq0Yc7T3JZC6
J6m7aJ8aZLkQd4dC8S7m2m5Q4vYJp5Yl0N4r3T8h5a6eQn9yWZxV2s1Kqg==
-----END PUBLIC KEY-----
";

/// Checks that `project` owns `host`, typically by looking up a signed claim
/// in DNS and verifying it with `public_key`.
pub trait DomainValidator: Send + Sync {
    fn validate<'a>(
        &'a self,
        project: &'a str,
        host: &'a str,
        public_key: &'a [u8],
    ) -> LocalBoxFuture<'a, AnyResult<()>>;
}
