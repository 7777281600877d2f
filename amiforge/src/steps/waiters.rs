//! Waiters for the resources the steps create.
//!
//! Each waiter is a thin describe loop over [`wait_until`]; the attempt budget and
//! delay come from the run's resolved polling overrides.

use crate::cancellation::CancellationToken;
use crate::cloud::{
    Ec2Api, Image, ImageQuery, ImageState, ImportTask, ImportTaskStatus, Instance, InstanceState,
    Snapshot, SnapshotState, SpotRequest, SpotRequestState,
};
use crate::pipeline::{wait_until, PollState, WaitError, WaitOptions};

/// Waits until an image is `available`.
///
/// A freshly registered image may not be visible yet, so "not found" keeps
/// waiting.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] if the image enters the `failed` state.
pub async fn wait_for_image(
    cancel: &CancellationToken,
    ec2: &dyn Ec2Api,
    image_id: &str,
    options: WaitOptions,
) -> Result<Image, WaitError> {
    let resource = format!("image {image_id}");
    wait_until(cancel, &resource, options, move || async move {
        let images = ec2.describe_images(&ImageQuery::ids([image_id])).await?;
        let Some(image) = images.into_iter().next() else {
            return Ok(PollState::Pending("not found".to_string()));
        };
        Ok(match image.state {
            Some(ImageState::Available) => PollState::Ready(image),
            Some(ImageState::Failed) => PollState::Failed(
                image
                    .state_reason
                    .unwrap_or_else(|| "image entered the failed state".to_string()),
            ),
            Some(state) => PollState::Pending(state.to_string()),
            None => PollState::Pending("unknown".to_string()),
        })
    })
    .await
}

/// Waits until an instance reaches `target`.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] if the instance terminates while waiting for
/// any other state.
pub async fn wait_for_instance(
    cancel: &CancellationToken,
    ec2: &dyn Ec2Api,
    instance_id: &str,
    target: InstanceState,
    options: WaitOptions,
) -> Result<Instance, WaitError> {
    let resource = format!("instance {instance_id}");
    wait_until(cancel, &resource, options, move || async move {
        let instance = match ec2.describe_instance(instance_id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => {
                return Ok(PollState::Pending("not found".to_string()));
            }
            Err(err) => return Err(err),
        };

        let state = instance.state;
        Ok(match state {
            state if state == target => PollState::Ready(instance),
            InstanceState::Terminated | InstanceState::ShuttingDown => {
                PollState::Failed(format!("instance is {state}"))
            }
            state => PollState::Pending(state.to_string()),
        })
    })
    .await
}

/// Waits until a snapshot is `completed`.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] if the snapshot enters the `error` state.
pub async fn wait_for_snapshot(
    cancel: &CancellationToken,
    ec2: &dyn Ec2Api,
    snapshot_id: &str,
    options: WaitOptions,
) -> Result<Snapshot, WaitError> {
    let resource = format!("snapshot {snapshot_id}");
    wait_until(cancel, &resource, options, move || async move {
        let snapshot = ec2.describe_snapshot(snapshot_id).await?;
        Ok(match snapshot.state {
            SnapshotState::Completed => PollState::Ready(snapshot),
            SnapshotState::Error => PollState::Failed(
                snapshot
                    .state_message
                    .unwrap_or_else(|| "snapshot entered the error state".to_string()),
            ),
            SnapshotState::Pending => PollState::Pending("pending".to_string()),
        })
    })
    .await
}

/// Waits until an import task is `completed`.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] carrying the task's status message if it is
/// deleted before completing.
pub async fn wait_for_import(
    cancel: &CancellationToken,
    ec2: &dyn Ec2Api,
    task_id: &str,
    options: WaitOptions,
) -> Result<ImportTask, WaitError> {
    let resource = format!("import task {task_id}");
    wait_until(cancel, &resource, options, move || async move {
        let task = ec2.describe_import_image_task(task_id).await?;
        Ok(match task.status {
            ImportTaskStatus::Completed => PollState::Ready(task),
            ImportTaskStatus::Deleting | ImportTaskStatus::Deleted => {
                PollState::Failed(task.status_message)
            }
            ImportTaskStatus::Active => PollState::Pending(format!("active: {}", task.status_message)),
        })
    })
    .await
}

/// Waits until a spot request is fulfilled with an instance.
///
/// # Errors
///
/// Returns [`WaitError::Failed`] if the request is closed, cancelled or fails.
pub async fn wait_for_spot_request(
    cancel: &CancellationToken,
    ec2: &dyn Ec2Api,
    request_id: &str,
    options: WaitOptions,
) -> Result<SpotRequest, WaitError> {
    let resource = format!("spot request {request_id}");
    wait_until(cancel, &resource, options, move || async move {
        let request = ec2.describe_spot_request(request_id).await?;
        Ok(match request.state {
            SpotRequestState::Active if request.instance_id.is_some() => PollState::Ready(request),
            SpotRequestState::Active | SpotRequestState::Open => {
                PollState::Pending(request.status_code)
            }
            SpotRequestState::Closed | SpotRequestState::Cancelled | SpotRequestState::Failed => {
                PollState::Failed(format!("{}: {}", request.status_code, request.status_message))
            }
        })
    })
    .await
}
