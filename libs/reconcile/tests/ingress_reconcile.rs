//! Ingress mesh reconciliation against the recording hypervisor.

use nodemesh_networking::{interface_name, Cluster, VpnPeer, WgKeyPair, INGRESS_PEER_NAME};
use nodemesh_reconcile::{
    Component, HostPortAllocator, HypervisorCall, HypervisorOp, IngressMeshReconciler,
    ReconcileContext, ReconcileError, ReconcileStep, RecordingHypervisor,
    WIREGUARD_HOST_PORT_NAME,
};
use rstest::rstest;

const IMAGE: &str = "registry.test/wireguard:1";

fn vpn_peer(name: &str, address: &str) -> VpnPeer {
    let keys = WgKeyPair::generate();
    VpnPeer {
        name: name.to_string(),
        address: address.to_string(),
        public_key: keys.public_key.to_string(),
        private_key: keys.private_key.to_string(),
    }
}

fn cluster() -> Cluster {
    Cluster {
        namespace: "tenants".to_string(),
        name: "blue".to_string(),
        vpn_peers: vec![
            vpn_peer(INGRESS_PEER_NAME, "10.0.0.1/24"),
            vpn_peer("a", "10.0.0.2/24"),
            vpn_peer("b", "10.0.0.3/24"),
        ],
    }
}

fn ingress_component() -> Component {
    let mut component = Component::new("tenants", "blue", INGRESS_PEER_NAME, "hv-1");
    HostPortAllocator::new("hv-1", 31820..=31830)
        .request(&mut component, WIREGUARD_HOST_PORT_NAME)
        .unwrap();
    component
}

fn ops(hv: &RecordingHypervisor) -> Vec<HypervisorOp> {
    hv.calls().iter().map(HypervisorCall::op).collect()
}

#[tokio::test]
async fn reconcile_runs_all_steps_in_order() {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    let config = IngressMeshReconciler::new(IMAGE)
        .reconcile(&ctx)
        .await
        .unwrap();

    assert_eq!(
        ops(&hv),
        vec![
            HypervisorOp::EnsureImage,
            HypervisorOp::UploadFiles,
            HypervisorOp::RunPod,
            HypervisorOp::RunPod,
        ]
    );
    assert!(hv.has_image(IMAGE));

    let iface = interface_name("tenants", "blue");
    let guest = component.secrets_file(&format!("{}.conf", iface));
    let calls = hv.calls();
    match (&calls[2], &calls[3]) {
        (
            HypervisorCall::RunPod { command: up, .. },
            HypervisorCall::RunPod { command: sync, .. },
        ) => {
            assert!(up.contains(&format!("wg-quick up {}", guest)));
            assert!(up.contains(&format!("wg show {}", iface)));
            assert_eq!(sync, &format!("wg syncconf {} {}", iface, guest));
        }
        other => panic!("unexpected calls: {:?}", other),
    }

    assert_eq!(
        hv.file(&component.secrets_file("wg-quick.conf")),
        Some(config.quick_config())
    );
    let full = hv.file(&component.secrets_file("wg.conf")).unwrap();
    assert_eq!(full, config.full_config());
    assert!(full.contains("ListenPort = 31820"));
    assert_eq!(full.matches("[Peer]").count(), 2);
}

#[tokio::test]
async fn repeated_reconcile_issues_identical_calls() {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };
    let reconciler = IngressMeshReconciler::new(IMAGE);

    reconciler.reconcile(&ctx).await.unwrap();
    let first = hv.calls();
    let first_full = hv.file(&component.secrets_file("wg.conf"));

    hv.clear_calls();
    reconciler.reconcile(&ctx).await.unwrap();

    assert_eq!(hv.calls(), first);
    assert_eq!(hv.file(&component.secrets_file("wg.conf")), first_full);
}

#[rstest]
#[case::image(HypervisorOp::EnsureImage, 1, ReconcileStep::EnsureImage, 1)]
#[case::upload(HypervisorOp::UploadFiles, 1, ReconcileStep::UploadConfig, 2)]
#[case::interface_up(HypervisorOp::RunPod, 1, ReconcileStep::InterfaceUp, 3)]
#[case::sync_config(HypervisorOp::RunPod, 2, ReconcileStep::SyncConfig, 4)]
#[tokio::test]
async fn failing_step_aborts_the_pass(
    #[case] op: HypervisorOp,
    #[case] nth: usize,
    #[case] expected: ReconcileStep,
    #[case] calls_made: usize,
) {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    hv.fail_on_nth(op, nth);
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    let err = IngressMeshReconciler::new(IMAGE)
        .reconcile(&ctx)
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with(expected.as_str()));
    match err {
        ReconcileError::Step { step, .. } => assert_eq!(step, expected),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hv.calls().len(), calls_made);
}

#[tokio::test]
async fn debug_pod_failures_do_not_fail_the_pass() {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    hv.fail_on(HypervisorOp::EnsurePod);
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    IngressMeshReconciler::new(IMAGE)
        .with_debug_pods(true)
        .reconcile(&ctx)
        .await
        .unwrap();

    let pod_calls = ops(&hv)
        .into_iter()
        .filter(|op| *op == HypervisorOp::EnsurePod)
        .count();
    assert_eq!(pod_calls, 2);
    assert_eq!(ops(&hv).last(), Some(&HypervisorOp::RunPod));
}

#[tokio::test]
async fn debug_pods_are_off_by_default() {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    IngressMeshReconciler::default().reconcile(&ctx).await.unwrap();
    assert!(hv.pods().is_empty());
}

#[tokio::test]
async fn missing_port_allocation_is_reported_before_any_call() {
    let cluster = cluster();
    let component = Component::new("tenants", "blue", INGRESS_PEER_NAME, "hv-1");
    let hv = RecordingHypervisor::new("hv-1");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    let err = IngressMeshReconciler::new(IMAGE)
        .reconcile(&ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::PortNotAllocated { .. }));
    assert!(hv.calls().is_empty());
}

#[tokio::test]
async fn missing_ingress_peer_is_a_mesh_error() {
    let mut cluster = cluster();
    cluster.vpn_peers.retain(|p| p.name != INGRESS_PEER_NAME);
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-1");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    let err = IngressMeshReconciler::new(IMAGE)
        .reconcile(&ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Mesh(_)));
}

#[tokio::test]
async fn component_on_another_hypervisor_is_rejected_before_any_call() {
    let cluster = cluster();
    let component = ingress_component();
    let hv = RecordingHypervisor::new("hv-2");
    let ctx = ReconcileContext {
        cluster: &cluster,
        component: &component,
        hypervisor: &hv,
    };

    let err = IngressMeshReconciler::new(IMAGE)
        .reconcile(&ctx)
        .await
        .unwrap_err();
    match err {
        ReconcileError::HypervisorMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, "hv-1");
            assert_eq!(actual, "hv-2");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(hv.calls().is_empty());
}
