use anyhow::Result;
use kindred_core::{
    GraphStateMachine, HistoryQuery, OperationLedger, OperationStatus, RecordRef, StateOutcome,
    VisibilityStore,
};

use super::Session;
use crate::cli::GraphCommands;
use crate::output::{self, emit};

fn transition(outcome: &StateOutcome) -> String {
    format!(
        "{}\n{}",
        output::collection(&outcome.collection),
        output::operations(std::slice::from_ref(&outcome.operation))
    )
}

pub async fn execute(session: &Session, cmd: GraphCommands) -> Result<()> {
    let state = &session.backend.state;
    let actor = session.actor.as_str();
    match cmd {
        GraphCommands::Init { collection } => {
            let coll = session.collection(&collection).await?;
            let outcome = state.initialize(coll.uuid, actor).await?;
            emit(session.format, &outcome, transition)
        }
        GraphCommands::Drift { collection } => {
            let coll = session.collection(&collection).await?;
            let report = state.detect_drift(coll.uuid, actor).await?;
            emit(session.format, &report, |r| output::drift(r).to_string())
        }
        GraphCommands::Sync { collection } => {
            let coll = session.collection(&collection).await?;
            let outcome = state.sync(coll.uuid, actor).await?;
            emit(session.format, &outcome, transition)
        }
        GraphCommands::Status { collection } => {
            let coll = session.collection(&collection).await?;
            let status = state.graph_status(coll.uuid).await?;
            emit(session.format, &status, |s| output::graph_status(s).to_string())
        }
        GraphCommands::View {
            collection,
            profile,
        } => {
            let coll = session.collection(&collection).await?;
            let profile = match profile {
                Some(id) => Some(session.profile(&id).await?.uuid),
                None => None,
            };
            let view = session.backend.visibility.visible_graph(coll.uuid, profile).await?;
            emit(session.format, &view, |v| {
                format!(
                    "{}\n{}",
                    output::entities(&v.entities),
                    output::relationships(&v.relationships)
                )
            })
        }
    }
}

/// Operation history of a collection, oldest first
pub async fn history(
    session: &Session,
    collection: &RecordRef,
    limit: Option<usize>,
    status: Option<OperationStatus>,
) -> Result<()> {
    let coll = session.collection(collection).await?;
    let mut query = HistoryQuery::for_collection(coll.uuid).limit(limit.unwrap_or(session.history_limit));
    if let Some(status) = status {
        query = query.status(status);
    }
    let operations = session.backend.ledger.history(query).await?;
    emit(session.format, &operations, |ops| output::operations(ops).to_string())
}
