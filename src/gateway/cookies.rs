//! Cookie filtering for authorization queries
//!
//! Only cookies owned by the auth backend are forwarded to it. Application
//! session cookies never leave the gateway in an authorization query.

/// Name prefix of the cookies the auth backend recognizes
pub const AUTH_COOKIE_PREFIX: &str = "wwwhisper-";

/// Keep only `name=value` pairs whose name starts with [`AUTH_COOKIE_PREFIX`].
///
/// Retained pairs keep their original order and are joined by `"; "`.
/// An empty or fully filtered header yields an empty string.
#[must_use]
pub fn filter_auth_cookies(cookie_header: &str) -> String {
    cookie_header
        .split(';')
        .map(str::trim)
        .filter(|pair| pair.starts_with(AUTH_COOKIE_PREFIX))
        .collect::<Vec<_>>()
        .join("; ")
}
