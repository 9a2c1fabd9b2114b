//! The core entity model: vocabulary, traits, entities, and the registry.

pub mod entities;
pub mod registry;
pub mod traits;
pub mod vocabulary;

pub use entities::{Asset, Entity, EntityType, Layer, Media, Project, Sequence, Shot, Stack, Version};
pub use registry::{Registry, RegistryError, RoleDefinition};
pub use traits::{Locatable, Location, Relational, Relationship, StorageType, Versionable};
pub use vocabulary::{FrameRange, FrameRate, Role, RoleClass, Status, Timecode, VocabularyError};
