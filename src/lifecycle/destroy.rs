//! Tear-down of a registered minion.

use tracing::{info, warn};

use crate::provider::Provider;
use crate::trust::TrustStore;

use super::error::DestroyError;

/// Removes `minion_id` from the master, then finds and destroys its
/// resource.
///
/// A deregistration failure does not stop the resource from being
/// destroyed; it is reported afterwards.
///
/// # Errors
///
/// Returns [`DestroyError::Lookup`] when no resource carries the id,
/// [`DestroyError::Destroy`] when the provider fails to destroy it and
/// [`DestroyError::Deregistration`] when only the key removal failed.
pub async fn destroy_minion<P, T>(
    provider: &P,
    trust: &T,
    minion_id: &str,
) -> Result<(), DestroyError>
where
    P: Provider + ?Sized,
    T: TrustStore + ?Sized,
{
    let deregistration = trust.deregister(minion_id).await.err();
    if let Some(err) = &deregistration {
        warn!(minion_id, error = %err, "failed to remove minion key, destroying anyway");
    }

    let (handle, extra) =
        provider
            .find_resource(minion_id)
            .await
            .map_err(|source| DestroyError::Lookup {
                minion_id: minion_id.to_owned(),
                source,
            })?;
    provider
        .destroy_resource(&handle, &extra)
        .await
        .map_err(|source| DestroyError::Destroy {
            minion_id: minion_id.to_owned(),
            source,
        })?;
    info!(minion_id, resource = %handle.id, "minion destroyed");

    deregistration.map_or(Ok(()), |source| {
        Err(DestroyError::Deregistration {
            minion_id: minion_id.to_owned(),
            source,
        })
    })
}
