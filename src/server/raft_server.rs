use crate::actor::WeakActorClient;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientStaleTerm,
    ProtoInstallSnapshotChunk, ProtoInstallSnapshotError, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess,
    ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, Index, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    SnapshotMeta, SnapshotStore, Term,
};
use crate::server::ShutdownSignal;
use crate::transport::Incoming;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

/// RaftRpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RaftRpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
    snapshot_store: SnapshotStore,
}

impl RaftRpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient, snapshot_store: SnapshotStore) -> Self {
        RaftRpcServer {
            logger,
            local_replica,
            snapshot_store,
        }
    }

    /// Serves raft connections routed by the stream layer until `shutdown_signal` resolves.
    pub(crate) async fn run(self, incoming: Incoming, shutdown_signal: ShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Serving raft RPCs");

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        match app_result {
            Ok(ok) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: ok.vote_granted,
                })),
            },
            Err(RequestVoteError::RequestTermOutOfDate(_)) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: false,
                })),
            },
            Err(RequestVoteError::ServerIoError(message)) => Self::request_vote_fault(message),
            Err(RequestVoteError::ActorExited) => {
                Self::request_vote_fault("Server internal replica task has exited".to_string())
            }
        }
    }

    fn request_vote_fault(message: String) -> ProtoRequestVoteResult {
        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault { message })),
            })),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let new_entries = rpc_request
            .new_entries
            .into_iter()
            .map(|proto_entry| AppendEntriesLogEntry {
                term: Term::new(proto_entry.term),
                data: proto_entry.data,
            })
            .collect();

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index: Index::new(rpc_request.commit_index),
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, Index::new(log_entry_index)) {
            (0, None) => Ok(None),
            (0, Some(_)) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, None) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, Some(index)) => Ok(Some((Term::new(term), index))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        // Empty
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: last_log_index.map(|i| i.as_u64()).unwrap_or(0),
                })
            }
            Err(AppendEntriesError::ServerIoError(message)) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: format!("Local IO failure: {}", message),
                })
            }
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }

    async fn handle_install_snapshot(
        &self,
        chunks: Streaming<ProtoInstallSnapshotChunk>,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let data_path = self.snapshot_store.incoming_path();
        let app_input = match Self::receive_snapshot(chunks, &data_path).await {
            Ok(input) => input,
            Err(status) => {
                if let Err(e) = tokio::fs::remove_file(&data_path).await {
                    slog::debug!(self.logger, "No partial snapshot to clean up at {:?}: {}", data_path, e);
                }
                return Err(status);
            }
        };
        slog::info!(
            self.logger,
            "Received snapshot through {:?} from {:?}",
            app_input.meta.last_included_index,
            app_input.leader_id
        );

        // From here on the replica owns the file.
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Ok(Self::convert_install_snapshot_result(app_result))
    }

    /// Streams chunks into `data_path`. The header (leader, term, meta) comes from the first chunk.
    async fn receive_snapshot(
        mut chunks: Streaming<ProtoInstallSnapshotChunk>,
        data_path: &Path,
    ) -> Result<InstallSnapshotInput, Status> {
        let first = chunks
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("InstallSnapshot stream is empty"))?;
        let proto_meta = first
            .meta
            .clone()
            .ok_or_else(|| Status::invalid_argument("First snapshot chunk is missing its meta"))?;
        let meta = SnapshotMeta::try_from(proto_meta).map_err(Status::invalid_argument)?;

        let mut file = tokio::fs::File::create(data_path)
            .await
            .map_err(|e| Status::internal(format!("Failed to create snapshot file: {}", e)))?;

        let mut chunk = first;
        let leader_term = Term::new(chunk.term);
        let leader_id = ReplicaId::new(chunk.client_node_id.clone());
        loop {
            file.write_all(&chunk.data)
                .await
                .map_err(|e| Status::internal(format!("Failed to write snapshot chunk: {}", e)))?;
            if chunk.done {
                break;
            }

            chunk = chunks
                .message()
                .await?
                .ok_or_else(|| Status::invalid_argument("InstallSnapshot stream ended before the last chunk"))?;
        }

        file.sync_all()
            .await
            .map_err(|e| Status::internal(format!("Failed to sync snapshot file: {}", e)))?;

        Ok(InstallSnapshotInput {
            leader_term,
            leader_id,
            meta,
            data_path: PathBuf::from(data_path),
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {})),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::ServerIoError(message)) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault { message })
            }
            Err(InstallSnapshotError::ActorExited) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Server internal replica task has exited".to_string(),
                })
            }
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RaftRpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        // Entries can be large. Only log the header.
        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries from {} term {} prev ({}, {}) commit {} entries {}",
            rpc_request.client_node_id,
            rpc_request.term,
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
            rpc_request.commit_index,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<Streaming<ProtoInstallSnapshotChunk>>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_result = self.handle_install_snapshot(rpc_request_wrapped.into_inner()).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_metadata_zero_pair_is_none() {
        assert_eq!(RaftRpcServer::convert_log_entry_metadata(0, 0).unwrap(), None);
        assert_eq!(
            RaftRpcServer::convert_log_entry_metadata(3, 7).unwrap(),
            Some((Term::new(3), Index::new(7).unwrap()))
        );
    }

    #[test]
    fn log_entry_metadata_half_zero_is_rejected() {
        let err = RaftRpcServer::convert_log_entry_metadata(0, 7).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = RaftRpcServer::convert_log_entry_metadata(3, 0).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn missing_log_reply_carries_last_index() {
        let reply = RaftRpcServer::convert_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            last_log_index: Index::new(4),
        }));

        match reply.result {
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(payload)),
            })) => assert_eq!(payload.last_log_entry_index, 4),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }
}
