//! Relay endpoint selection.

use rand::Rng;
use url::Url;

/// Picks one endpoint uniformly at random.
pub fn select_endpoint(endpoints: &[String]) -> Option<&str> {
    select_endpoint_with(endpoints, &mut rand::thread_rng())
}

/// Like [`select_endpoint`] with an explicit random source.
pub fn select_endpoint_with<'a, R: Rng + ?Sized>(
    endpoints: &'a [String],
    rng: &mut R,
) -> Option<&'a str> {
    if endpoints.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..endpoints.len());
    Some(endpoints[index].as_str())
}

/// Resolves an endpoint, which may be a path on the client origin.
///
/// The result always ends with `/` so protocol paths can be joined onto it.
pub fn resolve_endpoint(endpoint: &str, client_origin: &Url) -> Result<Url, url::ParseError> {
    let mut resolved = client_origin.join(endpoint)?;
    if !resolved.path().ends_with('/') {
        let path = format!("{}/", resolved.path());
        resolved.set_path(&path);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn endpoints() -> Vec<String> {
        vec![
            "https://a.relay/bare/".to_string(),
            "https://b.relay/bare/".to_string(),
            "/bare/".to_string(),
        ]
    }

    #[test]
    fn empty_pool_has_no_endpoint() {
        assert_eq!(select_endpoint(&[]), None);
    }

    #[test]
    fn single_endpoint_is_always_chosen() {
        let pool = vec!["/bare/".to_string()];
        for _ in 0..10 {
            assert_eq!(select_endpoint(&pool), Some("/bare/"));
        }
    }

    #[test]
    fn selection_stays_in_pool() {
        let pool = endpoints();
        for _ in 0..50 {
            let chosen = select_endpoint(&pool).unwrap();
            assert!(pool.iter().any(|e| e == chosen));
        }
    }

    #[test]
    fn explicit_rng_is_used() {
        let pool = endpoints();
        let mut rng = StepRng::new(0, 0);
        assert_eq!(
            select_endpoint_with(&pool, &mut rng),
            Some("https://a.relay/bare/")
        );
    }

    #[test]
    fn relative_endpoint_resolves_against_origin() {
        let origin = Url::parse("http://localhost:8080/").unwrap();
        assert_eq!(
            resolve_endpoint("/bare/", &origin).unwrap().as_str(),
            "http://localhost:8080/bare/"
        );
        assert_eq!(
            resolve_endpoint("https://a.relay/bare", &origin).unwrap().as_str(),
            "https://a.relay/bare/"
        );
    }
}
