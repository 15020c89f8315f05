pub mod connectivity_monitor;
pub mod credentials;
pub mod datastore;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use connectivity_monitor::{ConnectivityMonitor, ManualConnectivityMonitor, NetworkStatus, NoopConnectivityMonitor};
pub use credentials::{CredentialsProvider, EmptyCredentialsProvider, Token, User, UserCredentialsProvider};
pub use datastore::{Connection, Datastore, StreamHandle};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use stream::{InMemoryTransport, MultiplexedConnection, StreamTransport};
