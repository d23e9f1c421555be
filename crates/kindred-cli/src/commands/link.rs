use anyhow::Result;
use kindred_core::{ConfirmOutcome, LinkOutcome, LinkProposal, LinkResolver};

use super::Session;
use crate::cli::LinkCommands;
use crate::output::{self, emit};

fn recorded(outcome: &LinkOutcome) -> String {
    format!(
        "{}\n{}",
        output::links(std::slice::from_ref(&outcome.link)),
        output::operations(std::slice::from_ref(&outcome.operation))
    )
}

fn confirmed(outcome: &ConfirmOutcome) -> String {
    format!(
        "{}\n{}\n{}",
        output::links(std::slice::from_ref(&outcome.link)),
        output::entities(std::slice::from_ref(&outcome.merge.entity)),
        output::operations(std::slice::from_ref(&outcome.merge.operation))
    )
}

pub async fn execute(session: &Session, cmd: LinkCommands) -> Result<()> {
    let links = &session.backend.links;
    match cmd {
        LinkCommands::Propose {
            collection,
            graph_entity,
            target,
            confidence,
            link_type,
            name,
            description,
            tool,
        } => {
            let coll = session.collection(&collection).await?;
            let source = session.graph_entity(&graph_entity).await?;
            let target = match target {
                Some(id) => Some(session.entity(&id).await?.uuid),
                None => None,
            };
            let mut proposal = LinkProposal::new(
                coll.uuid,
                source.uuid,
                target,
                confidence,
                link_type,
                session.actor.as_str(),
            );
            proposal.common_name = name;
            proposal.description = description;
            proposal.created_by_tool = tool;
            let outcome = links.propose_link(proposal).await?;
            emit(session.format, &outcome, recorded)
        }
        LinkCommands::Confirm { link } => {
            let link = session.link(&link).await?;
            let outcome = links.confirm_link(link.uuid, session.actor.as_str()).await?;
            emit(session.format, &outcome, confirmed)
        }
        LinkCommands::Deactivate { link } => {
            let link = session.link(&link).await?;
            let outcome = links.deactivate_link(link.uuid, session.actor.as_str()).await?;
            emit(session.format, &outcome, recorded)
        }
        LinkCommands::Show { link } => {
            let link = session.link(&link).await?;
            emit(session.format, &link, |l| output::links(std::slice::from_ref(l)).to_string())
        }
        LinkCommands::List { entity } => {
            let entity = session.entity(&entity).await?;
            let active = links.active_links(entity.uuid).await?;
            emit(session.format, &active, |l| output::links(l).to_string())
        }
        LinkCommands::Best {
            collection,
            graph_entity,
        } => {
            let coll = session.collection(&collection).await?;
            let source = session.graph_entity(&graph_entity).await?;
            let best = links.best_candidate(coll.uuid, source.uuid).await?;
            emit(session.format, &best, |b| match b {
                Some(link) => output::links(std::slice::from_ref(link)).to_string(),
                None => format!("No candidate for {}", source.display_id),
            })
        }
    }
}
