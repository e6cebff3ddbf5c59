use kube::CustomResourceExt;

/// Print the CRD manifests for all three kinds, for the installer to apply
fn main() {
    let crds = [
        serde_yaml::to_string(&che_operator::crd::CheCluster::crd()),
        serde_yaml::to_string(&che_operator::crd::CheClusterBackup::crd()),
        serde_yaml::to_string(&che_operator::crd::CheClusterRestore::crd()),
    ];
    for crd in crds {
        match crd {
            Ok(yaml) => print!("---\n{}", yaml),
            Err(e) => {
                eprintln!("Failed to render CRD: {}", e);
                std::process::exit(1);
            }
        }
    }
}
