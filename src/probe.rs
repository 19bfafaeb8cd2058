//! Host capability probing.

use enum_as_inner::EnumAsInner;
use tracing::debug;

use crate::RigResult;
use crate::link::VethPair;

/// Outcome of probing the host for namespace and veth support.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner)]
pub enum Readiness {
    /// The host can run namespace-backed fixtures.
    Ready,
    /// A required capability is missing. Dependent tests should be
    /// skipped, not failed; CI hosts legitimately differ here.
    Unsupported { reason: String },
}

/// Probes whether the host can run the fixtures at all, by performing one
/// full namespace + veth provisioning cycle and tearing it down again.
///
/// Missing privilege or kernel features come back as
/// [`Readiness::Unsupported`]; any other failure is a genuine error.
pub async fn check_environment() -> RigResult<Readiness> {
    match VethPair::create().await {
        Ok(pair) => {
            drop(pair);
            debug!("environment probe: ready");
            Ok(Readiness::Ready)
        }
        Err(err) => match err.capability_gap() {
            Some(reason) => {
                debug!(reason, "environment probe: unsupported");
                Ok(Readiness::Unsupported {
                    reason: reason.to_string(),
                })
            }
            None => Err(err),
        },
    }
}
