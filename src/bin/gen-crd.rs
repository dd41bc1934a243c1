use fleetroll::crd::machine_deployment::MachineDeployment;
use fleetroll::crd::machine_set::MachineSet;
use kube::CustomResourceExt;
use serde_json::json;

fn main() -> anyhow::Result<()> {
    // Emits a v1 List so both CRDs apply in one go:
    // cargo run --bin gen-crd | kubectl apply -f -
    let list = json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [MachineDeployment::crd(), MachineSet::crd()],
    });

    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
