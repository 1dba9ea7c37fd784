use kube::CustomResourceExt;

fn main() {
    let resources = [
        rke_bootstrap_operator::resources::RKEBootstrap::crd(),
        rke_bootstrap_operator::resources::RKEControlPlane::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource).unwrap());
    }
}
