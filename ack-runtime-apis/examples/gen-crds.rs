use ack_runtime_apis::{
    bookstore::Book,
    elasticache::{CacheParameterGroup, ReplicationGroup},
    AdoptedResource,
};
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    let crds = [
        AdoptedResource::crd(),
        Book::crd(),
        CacheParameterGroup::crd(),
        ReplicationGroup::crd(),
    ];
    for crd in crds {
        println!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
