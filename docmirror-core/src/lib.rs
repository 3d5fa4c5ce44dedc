mod client;
mod oauth;
mod outcome;
mod types;

pub use client::{ApiErrorClass, DocsClient, DocsError};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use outcome::FetchOutcome;
pub use types::{
    AttributeDefinitionEntry, ContentsPage, CustomAttributeEntry, FolderAttributes, HubRef,
    ItemAttributes, ProjectRef, Relationships, RemoteFolder, RemoteItem, RemoteVersion,
    ResourceIdentifier, VersionAttributes, VersionCustomAttributes,
};
