/// Write-write conflict detection against other transactions' staged changes.
pub mod detection;
/// Resolution of the version of a document a transaction is allowed to see.
pub mod resolution;
