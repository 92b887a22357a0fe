mod client;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, DriveFile, DriveUser, FOLDER_MIME, FileList,
    children_query, modified_since_query,
};
