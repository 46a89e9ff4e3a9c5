mod directory;
mod messages;

pub use directory::{Directory, FileAttribute, FileEntry};
pub use messages::{
    BrowseResponse, ConnectToPeerRequest, ConnectToPeerResponse, DistributedSearchRequest,
    PrivateMessage, UserAddressResponse,
};
