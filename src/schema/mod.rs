//! Static schema metadata: message and method descriptors and the frozen
//! registry the marshaller and dispatcher resolve them from.

pub mod descriptor;
pub mod registry;

pub use descriptor::{
    FieldDescriptor, FieldType, Label, MessageDescriptor, MethodDescriptor, MethodKind,
};
pub use registry::{DescriptorRegistry, RegistryBuilder};
