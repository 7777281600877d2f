//! Whole builds against the in-memory cloud.

#[cfg(test)]
mod tests {
    use crate::builders::{
        BuildServices, EbsBuilder, EbsConfig, EbsVolumeBuilder, EbsVolumeConfig,
        ImportPostProcessor,
    };
    use crate::cancellation::CancellationToken;
    use crate::cloud::{ImageAttributeChange, ImageState, InstanceState, LaunchPermission, Tags};
    use crate::config::{
        AccessConfig, AmiConfig, BlockDevice, CommunicatorConfig, CommunicatorType, ImportConfig,
        RunConfig, SshInterface,
    };
    use crate::core::{ArtifactResources, EBS_BUILDER_ID, EBS_VOLUME_BUILDER_ID, IMPORT_BUILDER_ID};
    use crate::errors::AmiforgeError;
    use crate::steps::HOOK_PROVISION;
    use crate::testing::{CollectingUi, FakeCloud, FakeConnector, FakeTunnelOpener, RecordingHook};
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    const REGION: &str = "us-east-1";

    struct Harness {
        cloud: FakeCloud,
        ui: Arc<CollectingUi>,
        connector: Arc<FakeConnector>,
        hook: Arc<RecordingHook>,
        services: BuildServices,
        source_ami: String,
    }

    fn harness() -> Harness {
        let cloud = FakeCloud::new(REGION);
        let (source_ami, _) = cloud.seed_image(REGION, "base-image", ImageState::Available);
        let ui = Arc::new(CollectingUi::new());
        let connector = Arc::new(FakeConnector::new());
        let hook = Arc::new(RecordingHook::new());
        let services = BuildServices::new(cloud.provider())
            .with_ui(ui.clone())
            .with_connector(connector.clone())
            .with_hook(hook.clone())
            .with_env(Arc::new(HashMap::new()));
        Harness {
            cloud,
            ui,
            connector,
            hook,
            services,
            source_ami,
        }
    }

    fn run_config(source_ami: &str) -> RunConfig {
        RunConfig {
            source_ami: source_ami.to_string(),
            instance_type: "t3.micro".to_string(),
            communicator: CommunicatorConfig {
                username: "ec2-user".to_string(),
                ..CommunicatorConfig::default()
            },
            ..RunConfig::default()
        }
    }

    fn ebs_config(source_ami: &str) -> EbsConfig {
        EbsConfig {
            access: AccessConfig::new(REGION),
            run: run_config(source_ami),
            ami: AmiConfig {
                ami_name: "app-image".to_string(),
                ..AmiConfig::default()
            },
            ..EbsConfig::default()
        }
    }

    fn cancel_after(delay: Duration, reason: &'static str) -> Arc<CancellationToken> {
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel(reason);
        });
        cancel
    }

    fn all_terminated(cloud: &FakeCloud, region: &str) -> bool {
        cloud
            .instances(region)
            .iter()
            .all(|i| i.state == InstanceState::Terminated)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ebs_build_creates_ami_and_removes_temporary_resources() {
        let h = harness();
        let builder = EbsBuilder::new(ebs_config(&h.source_ami)).unwrap();

        let artifact = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.builder_id(), EBS_BUILDER_ID);
        let amis = artifact.ami_ids();
        assert_eq!(amis.len(), 1);
        let image = h.cloud.image(REGION, &amis[REGION]).unwrap();
        assert_eq!(image.name, "app-image");
        assert_eq!(artifact.state("SourceAMI"), Some(h.source_ami.as_str()));
        assert_eq!(artifact.state("BuildRegion"), Some(REGION));

        assert_eq!(h.cloud.instances(REGION).len(), 1);
        assert!(all_terminated(&h.cloud, REGION));
        assert_eq!(h.cloud.count("StopInstances"), 1);
        assert!(h.cloud.security_groups(REGION).is_empty());
        assert!(h.cloud.key_pairs(REGION).is_empty());

        assert_eq!(h.hook.events(), vec![(HOOK_PROVISION.to_string(), true)]);
        let targets = h.connector.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].username, "ec2-user");
        assert_eq!(targets[0].port, 22);
        assert!(targets[0].private_key.is_some());
        assert_eq!(h.connector.communicator().cleanups(), 1);
        assert!(h.ui.contains("Creating AMI app-image"));
    }

    #[test]
    fn test_ebs_steps_in_order() {
        let h = harness();
        let builder = EbsBuilder::new(ebs_config(&h.source_ami)).unwrap();

        let steps = builder.steps(&h.services).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();

        assert_eq!(
            names,
            vec![
                "source_ami_info",
                "ami_name_pre_validate",
                "network_info",
                "key_pair",
                "security_group",
                "iam_instance_profile",
                "run_source_instance",
                "create_ssm_tunnel",
                "connect",
                "set_generated_data",
                "provision",
                "cleanup_temp_keys",
                "stop_instance",
                "modify_ebs_backed_instance",
                "deregister_ami",
                "create_ami",
                "ami_region_copy",
                "modify_ami_attributes",
                "create_tags",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spot_build_launches_through_a_spot_request() {
        let h = harness();
        let mut config = ebs_config(&h.source_ami);
        config.run.spot_price = "auto".to_string();
        let builder = EbsBuilder::new(config).unwrap();

        let artifact = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.ami_ids().len(), 1);
        assert_eq!(h.cloud.count("RequestSpotInstances"), 1);
        assert_eq!(h.cloud.count("RunInstances"), 0);
        assert_eq!(h.cloud.spot_requests(REGION).len(), 1);
        assert_eq!(h.cloud.launches().len(), 1);
        assert!(all_terminated(&h.cloud, REGION));
        assert!(h.ui.contains("Terminating the source AWS instance"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_create_keeps_the_ami() {
        let h = harness();
        let mut config = ebs_config(&h.source_ami);
        config.ami.ami_users = vec!["123456789012".to_string()];
        h.cloud.fail_next("ModifyImageAttribute", "InternalError");
        let builder = EbsBuilder::new(config).unwrap();

        let err = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.is_cancelled());
        assert_eq!(h.cloud.images(REGION).len(), 2);
        assert!(h.ui.contains("has been kept"));
        assert!(all_terminated(&h.cloud, REGION));
        assert!(h.cloud.security_groups(REGION).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_on_failure_deregisters_the_ami() {
        let h = harness();
        let mut config = ebs_config(&h.source_ami);
        config.ami.ami_users = vec!["123456789012".to_string()];
        config.ami.rollback_image_on_failure = true;
        h.cloud.fail_next("ModifyImageAttribute", "InternalError");
        let builder = EbsBuilder::new(config).unwrap();

        let result = builder.run(&h.services, &CancellationToken::new()).await;

        assert!(result.is_err());
        let images = h.cloud.images(REGION);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, h.source_ami);
        assert_eq!(h.cloud.count("DeregisterImage"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_region_copy_adds_one_ami_per_region() {
        let h = harness();
        let mut config = ebs_config(&h.source_ami);
        config.ami.ami_regions = vec!["us-west-2".to_string(), REGION.to_string()];
        let builder = EbsBuilder::new(config).unwrap();
        assert_eq!(builder.config().ami.ami_regions, vec!["us-west-2".to_string()]);

        let artifact = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let amis = artifact.ami_ids();
        assert_eq!(amis.len(), 2);
        let copy = h.cloud.image("us-west-2", &amis["us-west-2"]).unwrap();
        assert_eq!(copy.name, "app-image");
        assert!(h.cloud.image(REGION, &amis[REGION]).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let h = harness();
        let builder = EbsBuilder::new(ebs_config(&h.source_ami)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel("interrupted");

        let err = builder.run(&h.services, &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_the_instance_reports_cancellation() {
        let h = harness();
        let builder = EbsBuilder::new(ebs_config(&h.source_ami)).unwrap();
        let cancel = cancel_after(Duration::from_secs(1), "ctrl-c");

        let err = builder.run(&h.services, &cancel).await.unwrap_err();

        assert!(err.is_cancelled(), "{err}");
        assert!(matches!(&err, AmiforgeError::Cancelled(reason) if reason == "ctrl-c"));
        assert_eq!(h.cloud.instances(REGION).len(), 1);
        assert!(all_terminated(&h.cloud, REGION));
        assert!(h.cloud.security_groups(REGION).is_empty());
        assert!(h.cloud.key_pairs(REGION).is_empty());
        assert_eq!(h.cloud.count("CreateImage"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfulfilled_spot_request_is_cancelled() {
        let h = harness();
        h.cloud
            .fail_spot_requests("capacity-not-available", "There is no Spot capacity available");
        let mut config = ebs_config(&h.source_ami);
        config.run.spot_price = "auto".to_string();
        let builder = EbsBuilder::new(config).unwrap();

        let err = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("There is no Spot capacity available"), "{err}");
        assert_eq!(h.cloud.count("CancelSpotInstanceRequests"), 1);
        assert_eq!(h.cloud.count("TerminateInstances"), 0);
        assert!(h.cloud.instances(REGION).is_empty());
        assert!(h.cloud.security_groups(REGION).is_empty());
        assert!(h.cloud.key_pairs(REGION).is_empty());
        assert!(h.ui.contains("Cancelling the spot request"));
    }

    #[test]
    fn test_config_errors_are_aggregated() {
        let errs = EbsBuilder::new(EbsConfig::default()).unwrap_err();

        assert!(errs.contains("region must be specified"));
        assert!(errs.contains("source_ami"));
        assert!(errs.contains("instance_type"));
        assert!(errs.contains("ami_name must be specified"));
        assert!(errs.contains("username"));
        assert!(errs.len() >= 5);
    }

    #[test]
    fn test_spot_with_instance_modification_is_rejected() {
        let mut config = ebs_config("ami-source");
        config.run.spot_price = "auto".to_string();
        config.ami.ena_support = Some(true);
        config.run.shutdown_behavior = "terminate".to_string();

        let errs = EbsBuilder::new(config).unwrap_err();

        assert!(errs.contains("spot instances do not support modification"));
        assert!(errs.contains("shutdown_behavior terminate"));
    }

    #[test]
    fn test_session_manager_without_tunnel_opener_fails() {
        let h = harness();
        let mut config = ebs_config(&h.source_ami);
        config.run.communicator.interface = Some(SshInterface::SessionManager);
        config.run.iam_instance_profile = "builder".to_string();
        let builder = EbsBuilder::new(config).unwrap();

        let err = builder.steps(&h.services).err().unwrap();

        assert!(err.to_string().contains("tunnel opener"));
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_manager_connects_through_the_tunnel() {
        let h = harness();
        h.cloud.seed_instance_profile("builder");
        let tunnels = Arc::new(FakeTunnelOpener::default());
        let services = h.services.clone().with_tunnel_opener(tunnels.clone());
        let mut config = ebs_config(&h.source_ami);
        config.run.communicator.interface = Some(SshInterface::SessionManager);
        config.run.iam_instance_profile = "builder".to_string();
        let builder = EbsBuilder::new(config).unwrap();

        builder
            .run(&services, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let opened = tunnels.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].2, 22);
        assert_eq!(tunnels.closed(), 1);
        let target = &h.connector.targets()[0];
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 8022);
        assert_eq!(h.cloud.count("AuthorizeSecurityGroupIngress"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_build_keeps_volumes_and_snapshots() {
        let h = harness();
        let mut tags = Tags::new();
        tags.insert("Name".to_string(), "data".to_string());
        let config = EbsVolumeConfig {
            access: AccessConfig::new(REGION),
            run: RunConfig {
                communicator: CommunicatorConfig {
                    kind: CommunicatorType::None,
                    ..CommunicatorConfig::default()
                },
                ..run_config(&h.source_ami)
            },
            ebs_volumes: vec![BlockDevice {
                device_name: "/dev/sdf".to_string(),
                volume_size: 20,
                volume_type: "gp3".to_string(),
                snapshot_volume: true,
                tags,
                ..BlockDevice::default()
            }],
            ..EbsVolumeConfig::default()
        };
        let builder = EbsVolumeBuilder::new(config).unwrap();

        let artifact = builder
            .run(&h.services, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.builder_id(), EBS_VOLUME_BUILDER_ID);
        let ArtifactResources::Volumes { volumes, snapshots } = artifact.resources() else {
            panic!("expected a volume artifact");
        };
        assert_eq!(volumes[REGION].len(), 1);
        assert_eq!(snapshots[REGION].len(), 1);
        let volume_id = &volumes[REGION][0];
        assert!(h.cloud.volume_exists(REGION, volume_id));
        assert!(h.cloud.snapshot_exists(REGION, &snapshots[REGION][0]));
        assert_eq!(h.cloud.tags(volume_id)["Name"], "data");

        assert!(h.connector.targets().is_empty());
        assert_eq!(h.hook.events(), vec![(HOOK_PROVISION.to_string(), false)]);
        assert!(all_terminated(&h.cloud, REGION));
        assert!(h.ui.contains("Created volumes"));
    }

    struct ImportHarness {
        cloud: FakeCloud,
        ui: Arc<CollectingUi>,
        services: BuildServices,
        dir: tempfile::TempDir,
    }

    impl ImportHarness {
        fn new() -> Self {
            let cloud = FakeCloud::new(REGION);
            let ui = Arc::new(CollectingUi::new());
            let services = BuildServices::new(cloud.provider())
                .with_ui(ui.clone())
                .with_env(Arc::new(HashMap::new()));
            Self {
                cloud,
                ui,
                services,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn disk(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, b"disk image").unwrap();
            path
        }
    }

    fn import_config() -> ImportConfig {
        ImportConfig {
            s3_key_name: "images/{{ .SourceAMIName }}.ova".to_string(),
            ..ImportConfig::new(REGION, "image-bucket")
        }
    }

    fn generated() -> BTreeMap<String, String> {
        BTreeMap::from([("SourceAMIName".to_string(), "web".to_string())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_renames_tags_and_cleans_up() {
        let h = ImportHarness::new();
        let mut config = import_config();
        config.ami_name = "imported-web".to_string();
        config.tags.insert("Team".to_string(), "images".to_string());
        config.ami_users = vec!["123456789012".to_string()];
        let post = ImportPostProcessor::new(config).unwrap();
        let files = vec![h.dir.path().join("notes.txt"), h.disk("web.ova")];

        let artifact = post
            .run(&h.services, &CancellationToken::new(), &files, &generated())
            .await
            .unwrap();

        assert_eq!(artifact.builder_id(), IMPORT_BUILDER_ID);
        let image_id = artifact.ami_ids()[REGION].clone();
        let images = h.cloud.images(REGION);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, image_id);
        assert_eq!(images[0].name, "imported-web");

        assert_eq!(h.cloud.tags(&image_id)["Team"], "images");
        for snapshot_id in images[0].snapshot_ids() {
            assert_eq!(h.cloud.tags(&snapshot_id)["Team"], "images");
        }
        assert_eq!(
            h.cloud.image_changes(&image_id),
            vec![ImageAttributeChange::LaunchPermissionAdd(vec![
                LaunchPermission::User("123456789012".to_string())
            ])]
        );

        let requests = h.cloud.import_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key, "images/web.ova");
        assert_eq!(requests[0].bucket, "image-bucket");
        assert_eq!(requests[0].format, "ova");
        assert!(!h.cloud.object_exists("image-bucket", "images/web.ova"));
        assert!(h.ui.contains("Deleting import source s3://image-bucket/images/web.ova"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_failure_reports_status_message() {
        let h = ImportHarness::new();
        h.cloud.fail_imports("ClientError: Unknown OS / Missing OS files");
        let post = ImportPostProcessor::new(import_config()).unwrap();

        let err = post
            .run(
                &h.services,
                &CancellationToken::new(),
                &[h.disk("web.ova")],
                &generated(),
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(
            message.contains("failed with status message: ClientError: Unknown OS / Missing OS files"),
            "{message}"
        );
        assert!(h.cloud.images(REGION).is_empty());
        assert!(h.cloud.object_exists("image-bucket", "images/web.ova"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_skip_clean_keeps_the_object() {
        let h = ImportHarness::new();
        let mut config = import_config();
        config.skip_clean = true;
        let post = ImportPostProcessor::new(config).unwrap();

        let artifact = post
            .run(
                &h.services,
                &CancellationToken::new(),
                &[h.disk("web.ova")],
                &generated(),
            )
            .await
            .unwrap();

        assert_eq!(artifact.ami_ids().len(), 1);
        assert!(h.cloud.object_exists("image-bucket", "images/web.ova"));
        assert_eq!(h.cloud.count("DeleteObject"), 0);
        assert_eq!(h.cloud.count("CopyImage"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_retries_start_failures() {
        let h = ImportHarness::new();
        h.cloud.fail_next("ImportImage", "RequestLimitExceeded");
        h.cloud.fail_next("ImportImage", "RequestLimitExceeded");
        let post = ImportPostProcessor::new(import_config()).unwrap();

        post.run(
            &h.services,
            &CancellationToken::new(),
            &[h.disk("web.ova")],
            &generated(),
        )
        .await
        .unwrap();

        assert_eq!(h.cloud.count("ImportImage"), 3);
        assert_eq!(h.cloud.import_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_cancelled_during_start_retries() {
        let h = ImportHarness::new();
        h.cloud.fail_next("ImportImage", "RequestLimitExceeded");
        let post = ImportPostProcessor::new(import_config()).unwrap();
        let cancel = cancel_after(Duration::from_millis(100), "shutdown");

        let err = post
            .run(&h.services, &cancel, &[h.disk("web.ova")], &generated())
            .await
            .unwrap_err();

        assert!(err.is_cancelled(), "{err}");
        assert!(h.cloud.import_requests().is_empty());
        assert!(h.cloud.object_exists("image-bucket", "images/web.ova"));
        assert_eq!(h.cloud.count("DeleteObject"), 0);
    }

    #[tokio::test]
    async fn test_import_needs_a_matching_readable_file() {
        let h = ImportHarness::new();
        let post = ImportPostProcessor::new(import_config()).unwrap();
        let cancel = CancellationToken::new();

        let err = post
            .run(&h.services, &cancel, &[h.disk("web.vmdk")], &generated())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no ova image file found"), "{err}");

        let missing = h.dir.path().join("gone.ova");
        let err = post
            .run(&h.services, &cancel, &[missing], &generated())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to open"), "{err}");

        assert!(h.cloud.calls().is_empty());
        assert!(h.ui.lines().is_empty());
    }

    #[test]
    fn test_import_config_is_validated_up_front() {
        let mut config = ImportConfig::new("", "");
        config.format = "qcow2".to_string();

        let errs = ImportPostProcessor::new(config).unwrap_err();

        assert!(errs.contains("region must be specified"));
        assert!(errs.contains("s3_bucket_name must be set"));
        assert!(errs.contains("invalid format 'qcow2'"));
    }
}
