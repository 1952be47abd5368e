//! Hostname resolution for service registration

use tracing::info;

/// Resolve the host to advertise, checking environment overrides in order:
/// a service-specific `{SERVICE_NAME}_HOST` (uppercased, dashes to
/// underscores), the generic `SERVICE_HOST`, the container `HOSTNAME`, then
/// `localhost`.
pub fn resolve_hostname(service_name: Option<&str>) -> String {
    resolve_hostname_or(service_name, None)
}

/// Same cascade with an explicitly configured host slotted between the env
/// overrides and the container fallbacks: `{SERVICE_NAME}_HOST` →
/// `SERVICE_HOST` → configured host → `HOSTNAME` → `localhost`.
///
/// A configured value of `localhost` counts as unset so a container's
/// `HOSTNAME` still wins over an untouched default.
pub fn resolve_hostname_or(service_name: Option<&str>, configured_host: Option<&str>) -> String {
    if let Some(name) = service_name.filter(|n| !n.is_empty()) {
        let service_env_var = service_host_env_var(name);
        if let Ok(host) = std::env::var(&service_env_var) {
            if !host.is_empty() {
                info!("Using service-specific hostname from {}: {}", service_env_var, host);
                return host;
            }
        }
    }

    if let Ok(host) = std::env::var("SERVICE_HOST") {
        if !host.is_empty() {
            info!("Using generic SERVICE_HOST: {}", host);
            return host;
        }
    }

    if let Some(host) = configured_host.filter(|h| !h.is_empty() && *h != "localhost") {
        info!("Using configured service host: {}", host);
        return host.to_string();
    }

    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            info!("Using container HOSTNAME: {}", host);
            return host;
        }
    }

    info!("Using fallback hostname: localhost");
    "localhost".to_string()
}

/// Environment variable name a service-specific host override is read from
pub fn service_host_env_var(service_name: &str) -> String {
    format!("{}_HOST", service_name.to_uppercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_host_env_var_name() {
        assert_eq!(service_host_env_var("mapping-service"), "MAPPING_SERVICE_HOST");
        assert_eq!(service_host_env_var("registry"), "REGISTRY_HOST");
    }

    #[test]
    fn test_fallback_is_localhost() {
        // Use a name whose env var cannot plausibly be set
        std::env::remove_var("NO_SUCH_SERVICE_XYZ_HOST");
        std::env::remove_var("SERVICE_HOST");
        std::env::remove_var("HOSTNAME");
        assert_eq!(resolve_hostname(Some("no-such-service-xyz")), "localhost");
    }

    #[test]
    fn test_service_specific_override_wins() {
        std::env::set_var("OCR_MODULE_HOST", "10.1.2.3");
        assert_eq!(resolve_hostname(Some("ocr-module")), "10.1.2.3");
        std::env::remove_var("OCR_MODULE_HOST");
    }

    #[test]
    fn test_configured_host_beats_container_fallbacks() {
        std::env::remove_var("CFG_SVC_XYZ_HOST");
        std::env::remove_var("SERVICE_HOST");
        assert_eq!(
            resolve_hostname_or(Some("cfg-svc-xyz"), Some("10.0.0.9")),
            "10.0.0.9"
        );
        // An untouched localhost default does not shadow the fallbacks
        std::env::remove_var("HOSTNAME");
        assert_eq!(
            resolve_hostname_or(Some("cfg-svc-xyz"), Some("localhost")),
            "localhost"
        );
    }

    #[test]
    fn test_service_env_beats_configured_host() {
        std::env::set_var("ENV_SVC_XYZ_HOST", "172.16.0.5");
        assert_eq!(
            resolve_hostname_or(Some("env-svc-xyz"), Some("10.0.0.9")),
            "172.16.0.5"
        );
        std::env::remove_var("ENV_SVC_XYZ_HOST");
    }
}
