//! Resource requirements for generated containers
//!
//! Starts from the platform baseline and applies annotation overrides. Ephemeral
//! storage is only emitted when the pod asks for it so clusters keep their own
//! defaults.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::annotations::{self, PodAnnotations};
use crate::platform::Platform;
use crate::{Error, Result};

const CPU: &str = "cpu";
const MEMORY: &str = "memory";
const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

#[derive(Clone, Copy)]
enum Kind {
    Limit,
    Request,
}

/// Build limits and requests for an agent container
pub fn resource_requirements(
    platform: Platform,
    annotations: &PodAnnotations<'_>,
) -> Result<ResourceRequirements> {
    let defaults = platform.default_resources();

    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    let entries = [
        (Kind::Limit, CPU, annotations::LIMITS_CPU, Some(defaults.cpu_limit)),
        (Kind::Limit, MEMORY, annotations::LIMITS_MEMORY, Some(defaults.memory_limit)),
        (Kind::Limit, EPHEMERAL_STORAGE, annotations::LIMITS_EPHEMERAL, None),
        (Kind::Request, CPU, annotations::REQUESTS_CPU, Some(defaults.cpu_request)),
        (Kind::Request, MEMORY, annotations::REQUESTS_MEMORY, Some(defaults.memory_request)),
        (Kind::Request, EPHEMERAL_STORAGE, annotations::REQUESTS_EPHEMERAL, None),
    ];

    for (kind, resource, key, default) in entries {
        let value = match (annotations.get(key), default) {
            (Some(value), _) if !is_valid_quantity(value) => {
                return Err(Error::validation(format!(
                    "annotation {key} has invalid quantity '{value}'"
                )));
            }
            (Some(value), _) | (None, Some(value)) => value,
            (None, None) => continue,
        };

        let list = match kind {
            Kind::Limit => &mut limits,
            Kind::Request => &mut requests,
        };
        list.insert(resource.to_string(), Quantity(value.to_string()));
    }

    Ok(ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    })
}

/// Whether `s` follows the Kubernetes quantity grammar:
/// `<signedNumber><suffix>` where the suffix is a binary SI unit (`Ki`..`Ei`),
/// a decimal SI unit (`n`, `u`, `m`, `k`, `M`..`E`) or a decimal exponent
/// (`e3`, `E-2`).
pub fn is_valid_quantity(s: &str) -> bool {
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    if !is_decimal(number) {
        return false;
    }

    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        _ => suffix
            .strip_prefix(['e', 'E'])
            .map(|exp| exp.strip_prefix(['+', '-']).unwrap_or(exp))
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())),
    }
}

fn is_decimal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();

    if fraction.is_some_and(|f| f.contains('.')) {
        return false;
    }
    let digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());

    match fraction {
        None => !whole.is_empty() && digits(whole),
        Some(f) => (!whole.is_empty() || !f.is_empty()) && digits(whole) && digits(f),
    }
}
