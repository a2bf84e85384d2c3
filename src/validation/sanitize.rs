// src/validation/sanitize.rs

/// Maximum length of a tenant name
pub const MAX_NAME_LEN: usize = 32;

/// Turns free text into a candidate tenant name.
///
/// Lowercases, maps anything outside `[a-z0-9_]` to `_`, strips leading
/// characters that are not letters and truncates to 32 characters. The result
/// may still be too short to validate.
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' })
        .collect();

    mapped
        .trim_start_matches(|c: char| !c.is_ascii_lowercase())
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

/// Reduces user input such as `https://Example.COM:8443/path` to `example.com`
pub fn sanitize_domain(raw: &str) -> String {
    let mut domain = raw.trim();

    if let Some(idx) = domain.find("://") {
        domain = &domain[idx + 3..];
    }
    if let Some(idx) = domain.find(|c| c == '/' || c == '?' || c == '#') {
        domain = &domain[..idx];
    }
    if let Some(idx) = domain.rfind('@') {
        domain = &domain[idx + 1..];
    }
    if let Some(idx) = domain.find(':') {
        domain = &domain[..idx];
    }

    domain.trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate_domain, validate_name};
    use proptest::prelude::*;

    #[test]
    fn names() {
        assert_eq!(sanitize_name("Acme Corp"), "acme_corp");
        assert_eq!(sanitize_name("42-shop"), "shop");
        assert_eq!(sanitize_name(&"x".repeat(40)).len(), 32);
    }

    #[test]
    fn domains() {
        assert_eq!(sanitize_domain("https://Example.COM:8443/path?q=1"), "example.com");
        assert_eq!(sanitize_domain("acme.test."), "acme.test");
        assert_eq!(sanitize_domain("  www.acme.test  "), "www.acme.test");
    }

    proptest! {
        #[test]
        fn sanitized_names_validate_when_long_enough(raw in ".{0,64}") {
            let name = sanitize_name(&raw);
            prop_assert!(name.len() <= MAX_NAME_LEN);
            if name.len() >= 3 {
                prop_assert!(validate_name(&name).is_ok(), "{:?} -> {:?}", raw, name);
            }
        }

        #[test]
        fn sanitizing_a_url_keeps_the_host(host in "[a-z]{1,10}\\.[a-z]{2,6}", port in 1u16..65535, path in "[a-z/]{0,10}") {
            let url = format!("https://{}:{}/{}", host.to_uppercase(), port, path);
            let domain = sanitize_domain(&url);
            prop_assert_eq!(&domain, &host);
            prop_assert!(validate_domain(&domain).is_ok());
        }
    }
}
