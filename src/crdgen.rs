use controller::api::ManagedCertificate;
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&ManagedCertificate::crd()).unwrap())
}
