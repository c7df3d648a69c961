//! Connection URL parsing.
//!
//! The wire protocol's connection string is not a standard RFC 3986 URL: it
//! packs host, port, database, user, and password into colon-separated
//! segments terminated by a semicolon, with an optional `?key=value&...`
//! query suffix for TLS knobs.
//!
//! ```text
//! scheme://host:port:database:user:password;?tls=true&tlsInsecureSkipVerify=true
//! ```

use crate::error::{DriverError, Result};

/// The parsed form of a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// The scheme, kept verbatim (the protocol does not constrain it further).
    pub scheme: String,
    /// Host portion, used both for dialing and as the TLS server name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Target database/namespace name.
    pub database: String,
    /// Username presented during the handshake.
    pub user: String,
    /// Password presented during the handshake.
    pub password: String,
    /// Recognized `?key=value` query parameters.
    pub params: UrlParams,
}

/// The subset of query parameters the driver understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParams {
    /// `tls=true` upgrades the socket after dialing.
    pub tls: bool,
    /// Path to a PEM-encoded CA bundle, overriding the platform trust store.
    pub tls_ca_file: Option<String>,
    /// Path to a PEM-encoded client certificate for mutual TLS.
    pub tls_cert_file: Option<String>,
    /// Path to the PEM-encoded private key matching `tls_cert_file`.
    pub tls_key_file: Option<String>,
    /// Disables certificate verification entirely. Dangerous; intended for
    /// local development against self-signed servers.
    pub tls_insecure_skip_verify: bool,
}

impl ParsedUrl {
    /// Parses a connection URL of the form
    /// `scheme://host:port:database:user:password;?key=value&...`.
    pub fn parse(raw: &str) -> Result<ParsedUrl> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| malformed(raw, "missing scheme separator \"://\""))?;

        let (body, query) = match rest.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (rest, None),
        };

        let body = body
            .strip_suffix(';')
            .ok_or_else(|| malformed(raw, "missing terminating \";\""))?;

        let mut segments = body.splitn(5, ':');
        let host = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed(raw, "empty host"))?
            .to_string();
        let port_str = segments
            .next()
            .ok_or_else(|| malformed(raw, "missing port"))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| malformed(raw, "port is not a valid u16"))?;
        let database = segments
            .next()
            .ok_or_else(|| malformed(raw, "missing database"))?
            .to_string();
        let user = segments
            .next()
            .ok_or_else(|| malformed(raw, "missing user"))?
            .to_string();
        let password = segments
            .next()
            .ok_or_else(|| malformed(raw, "missing password"))?
            .to_string();

        let params = match query {
            Some(q) => parse_params(q, raw)?,
            None => UrlParams::default(),
        };

        Ok(ParsedUrl {
            scheme: scheme.to_string(),
            host,
            port,
            database,
            user,
            password,
            params,
        })
    }

    /// The `host:port` pair used for dialing and as the TLS server name.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_params(query: &str, raw: &str) -> Result<UrlParams> {
    let mut params = UrlParams::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| malformed(raw, "query parameter missing \"=\""))?;
        match key {
            "tls" => params.tls = parse_bool(value),
            "tlsCAFile" => params.tls_ca_file = Some(value.to_string()),
            "tlsCertFile" => params.tls_cert_file = Some(value.to_string()),
            "tlsKeyFile" => params.tls_key_file = Some(value.to_string()),
            "tlsInsecureSkipVerify" => params.tls_insecure_skip_verify = parse_bool(value),
            _ => { /* unrecognized parameters are ignored, not rejected */ }
        }
    }
    Ok(params)
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn malformed(raw: &str, reason: &str) -> DriverError {
    DriverError::ProtocolViolation(format!("malformed connection URL {raw:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_url() {
        let parsed = ParsedUrl::parse("scheme://h:1776:db:u:p;").unwrap();
        assert_eq!(parsed.scheme, "scheme");
        assert_eq!(parsed.host, "h");
        assert_eq!(parsed.port, 1776);
        assert_eq!(parsed.database, "db");
        assert_eq!(parsed.user, "u");
        assert_eq!(parsed.password, "p");
        assert_eq!(parsed.address(), "h:1776");
        assert!(!parsed.params.tls);
    }

    #[test]
    fn parses_tls_query_params() {
        let parsed = ParsedUrl::parse(
            "syndra://wronghost:1776:db:u:p;?tls=true&tlsInsecureSkipVerify=true&tlsCAFile=/etc/ca.pem",
        )
        .unwrap();
        assert!(parsed.params.tls);
        assert!(parsed.params.tls_insecure_skip_verify);
        assert_eq!(parsed.params.tls_ca_file.as_deref(), Some("/etc/ca.pem"));
        assert!(parsed.params.tls_cert_file.is_none());
    }

    #[test]
    fn unrecognized_query_params_are_ignored() {
        let parsed = ParsedUrl::parse("scheme://h:1776:db:u:p;?foo=bar").unwrap();
        assert!(!parsed.params.tls);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(ParsedUrl::parse("h:1776:db:u:p;").is_err());
    }

    #[test]
    fn rejects_missing_semicolon() {
        assert!(ParsedUrl::parse("scheme://h:1776:db:u:p").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(ParsedUrl::parse("scheme://h:notaport:db:u:p;").is_err());
    }

    #[test]
    fn password_may_contain_no_further_colons_but_user_password_split_is_strict() {
        // splitn(5, ':') means a password containing ':' is kept intact as
        // the final segment rather than silently truncated.
        let parsed = ParsedUrl::parse("scheme://h:1776:db:u:p:extra;").unwrap();
        assert_eq!(parsed.password, "p:extra");
    }
}
