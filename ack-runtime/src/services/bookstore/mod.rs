//! The bookstore sample service.

use std::sync::Arc;

use ack_runtime_apis::{
    AwsIdentifiers,
    bookstore::{Book, BookSpec, BookStatus},
};
use kube::ResourceExt;

use crate::{errors::ControllerError, registry::Registry, types::AwsResource};

mod manager;
pub mod sdk;

pub use manager::{BookManager, BookManagerFactory, Connect};

pub const SERVICE_ALIAS: &str = "bookstore";
pub const API_GROUP: &str = "bookstore.services.k8s.aws";

impl AwsResource for Book {
    type Spec = BookSpec;
    type Status = BookStatus;

    fn spec(&self) -> &BookSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut BookSpec {
        &mut self.spec
    }

    fn status(&self) -> Option<&BookStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut BookStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn set_identifiers(&mut self, identifiers: &AwsIdentifiers) -> Result<(), ControllerError> {
        match identifiers.name_or_id.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => {
                self.spec.name = Some(name.to_string());
                Ok(())
            }
            None => Err(ControllerError::terminal("nameOrID is required to adopt a Book")),
        }
    }
}

/// Backend name of a book, defaults to the name of the custom resource.
pub fn book_name(book: &Book) -> String {
    book.spec
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| book.name_any())
}

pub fn register(registry: &Registry, factory: Arc<BookManagerFactory>) {
    registry.register_resource_manager_factory::<Book>(factory);
}
