//! Small helpers shared by the reconcilers and adapters

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::PodStatus;

use crate::crd::LabelSelector;
use crate::error::is_conflict;
use crate::{Error, Result};

/// Render a label selector as a list-params selector string.
///
/// Supported operators: In, NotIn, Exists, DoesNotExist.
pub fn selector_string(selector: &LabelSelector) -> Result<String> {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    for req in &selector.match_expressions {
        match req.operator.as_str() {
            "In" | "NotIn" => {
                if req.values.is_empty() {
                    return Err(Error::ValidationError(format!(
                        "selector requirement on {} has operator {} but no values",
                        req.key, req.operator
                    )));
                }
                let op = if req.operator == "In" { "in" } else { "notin" };
                terms.push(format!("{} {} ({})", req.key, op, req.values.join(",")));
            }
            "Exists" => terms.push(req.key.clone()),
            "DoesNotExist" => terms.push(format!("!{}", req.key)),
            other => {
                return Err(Error::ValidationError(format!(
                    "invalid selector operator {:?} on key {}",
                    other, req.key
                )))
            }
        }
    }

    Ok(terms.join(","))
}

/// Evaluate a label selector against a label map.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    for (k, v) in &selector.match_labels {
        if labels.get(k) != Some(v) {
            return false;
        }
    }
    for req in &selector.match_expressions {
        let value = labels.get(&req.key);
        let ok = match req.operator.as_str() {
            "In" => value.map(|v| req.values.contains(v)).unwrap_or(false),
            "NotIn" => value.map(|v| !req.values.contains(v)).unwrap_or(true),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Convert a Kubernetes meta/v1 label selector into the CRD-local shape.
pub fn from_k8s_selector(
    selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
) -> LabelSelector {
    LabelSelector {
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        match_expressions: selector
            .match_expressions
            .iter()
            .flatten()
            .map(|req| crate::crd::LabelSelectorRequirement {
                key: req.key.clone(),
                operator: req.operator.clone(),
                values: req.values.clone().unwrap_or_default(),
            })
            .collect(),
    }
}

/// Render a Kubernetes meta/v1 label selector as a list-params string.
pub fn k8s_selector_string(
    selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
) -> Result<String> {
    selector_string(&from_k8s_selector(selector))
}

/// Parse a Kubernetes quantity string (8Gi, 100Mi, 1G, 512) into bytes.
pub fn parse_quantity(quantity: &str) -> Result<i64> {
    let q = quantity.trim();
    if q.is_empty() {
        return Err(Error::ValidationError("empty quantity".to_string()));
    }

    let split = q.find(|c: char| !c.is_ascii_digit()).unwrap_or(q.len());
    let (digits, suffix) = q.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid quantity {:?}", quantity)))?;

    let multiplier: i64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        _ => {
            return Err(Error::ValidationError(format!(
                "invalid quantity suffix {:?} in {:?}",
                suffix, quantity
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::ValidationError(format!("quantity {:?} overflows", quantity)))
}

/// Normalise an infrastructure provider tag to the canonical snapstore
/// provider name.
pub fn storage_provider(provider: Option<&str>) -> Result<String> {
    let tag = match provider {
        None => return Ok(String::new()),
        Some(p) => p,
    };
    match tag {
        "aws" | "S3" => Ok("S3".to_string()),
        "azure" | "ABS" => Ok("ABS".to_string()),
        "gcp" | "GCS" => Ok("GCS".to_string()),
        "alicloud" | "OSS" => Ok("OSS".to_string()),
        "openstack" | "Swift" => Ok("Swift".to_string()),
        "local" | "Local" => Ok("Local".to_string()),
        _ => Err(Error::ValidationError(format!(
            "unsupported storage provider {:?}",
            tag
        ))),
    }
}

/// True when any container of the pod sits in CrashLoopBackOff.
pub fn is_pod_in_crashloop_backoff(status: &PodStatus) -> bool {
    status
        .container_statuses
        .iter()
        .flatten()
        .any(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref())
                == Some("CrashLoopBackOff")
        })
}

/// First six characters of a UID, used in derived child names.
pub fn uid_suffix(uid: &str) -> Result<String> {
    if uid.len() < 6 {
        return Err(Error::ValidationError(format!("uid {:?} too short", uid)));
    }
    Ok(uid.chars().take(6).collect())
}

/// Parse a bind address, accepting the `:8080` shorthand.
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| Error::ValidationError(format!("invalid bind address {:?}", addr)))
}

/// Retry an API operation on optimistic-concurrency conflicts with capped
/// exponential backoff.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> kube::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = kube::Result<T>>,
{
    let mut delay = Duration::from_millis(100);
    for _ in 0..4 {
        match op().await {
            Err(e) if is_conflict(&e) => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            other => return other,
        }
    }
    op().await
}
