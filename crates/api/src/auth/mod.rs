//! Authentication and merchant provisioning

pub mod middleware;

#[cfg(test)]
mod middleware_tests;

pub use middleware::{
    admin_auth, client_ip_from_headers, extract_client_ip, merchant_auth, worker_auth,
    CurrentMerchant,
};
