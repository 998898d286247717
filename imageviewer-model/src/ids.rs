//! Strongly typed identifiers.
//!
//! All ids are UUID-backed newtypes so a collection id can never be handed
//! to a job-store method and vice versa.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies one collection document.
    CollectionId
);
uuid_id!(
    /// Identifies one image entry within a collection.
    ImageId
);
uuid_id!(
    /// Identifies a background job.
    JobId
);
uuid_id!(
    /// Identifies a per-collection, per-artifact-kind processing job state.
    JobStateId
);
uuid_id!(
    /// Identifies a cache folder root.
    CacheFolderId
);
uuid_id!(
    /// Identifies a library (a root folder collections are discovered under).
    LibraryId
);
