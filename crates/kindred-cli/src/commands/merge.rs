use anyhow::{bail, Context, Result};
use kindred_core::{
    GraphError, MergeEngine, MergeOutcome, MergeOverrides, MergeRequest, RecordRef, SplitOutcome,
    SplitRequest,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::Session;
use crate::output::{self, emit};

pub struct MergeArgs {
    pub collection: RecordRef,
    pub sources: Vec<RecordRef>,
    pub into: Option<RecordRef>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Option<String>,
}

fn merged(outcome: &MergeOutcome) -> String {
    format!(
        "{}\n{}",
        output::entities(std::slice::from_ref(&outcome.entity)),
        output::operations(std::slice::from_ref(&outcome.operation))
    )
}

fn split_apart(outcome: &SplitOutcome) -> String {
    format!(
        "{}\n{}",
        output::entities(&outcome.entities),
        output::operations(std::slice::from_ref(&outcome.operation))
    )
}

/// Parse a `--properties` argument; it must be a JSON object
pub fn parse_properties(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--properties is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--properties must be a JSON object"),
    }
}

/// Split a `--part` argument into record references
pub fn parse_part(raw: &str) -> Result<Vec<RecordRef>> {
    let refs = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<RecordRef>)
        .collect::<Result<Vec<_>, GraphError>>()?;
    if refs.is_empty() {
        bail!("empty --part {:?}", raw);
    }
    Ok(refs)
}

async fn graph_entity_uuids(session: &Session, refs: &[RecordRef]) -> Result<BTreeSet<Uuid>> {
    let mut uuids = BTreeSet::new();
    for id in refs {
        uuids.insert(session.graph_entity(id).await?.uuid);
    }
    Ok(uuids)
}

pub async fn merge(session: &Session, args: MergeArgs) -> Result<()> {
    let coll = session.collection(&args.collection).await?;
    let sources = graph_entity_uuids(session, &args.sources).await?;

    let mut request = MergeRequest::new(coll.uuid, sources, session.actor.as_str());
    if let Some(target) = &args.into {
        request = request.into_target(session.entity(target).await?.uuid);
    }
    let overrides = MergeOverrides {
        name: args.name,
        description: args.description,
        properties: args.properties.as_deref().map(parse_properties).transpose()?,
    };
    if !overrides.is_empty() {
        request = request.with_overrides(overrides);
    }

    let outcome = session.backend.merges.merge(request).await?;
    emit(session.format, &outcome, merged)
}

pub async fn unmerge(session: &Session, entity: &RecordRef) -> Result<()> {
    let entity = session.entity(entity).await?;
    let outcome = session
        .backend
        .merges
        .unmerge(entity.uuid, session.actor.as_str())
        .await?;
    emit(session.format, &outcome, split_apart)
}

pub async fn split(session: &Session, entity: &RecordRef, parts: &[String]) -> Result<()> {
    let entity = session.entity(entity).await?;
    let mut partition = Vec::with_capacity(parts.len());
    for part in parts {
        partition.push(graph_entity_uuids(session, &parse_part(part)?).await?);
    }

    let outcome = session
        .backend
        .merges
        .split(SplitRequest {
            collection_uuid: entity.collection_uuid,
            entity_uuid: entity.uuid,
            partition,
            performed_by: session.actor.clone(),
        })
        .await?;
    emit(session.format, &outcome, split_apart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_parse_properties() {
        let map = parse_properties(r#"{"ticker": "ACME", "employees": 12}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert!(parse_properties("[1, 2]").is_err());
        assert!(parse_properties("{").is_err());
    }

    #[test_case("11111111,22222222", 2 ; "two refs")]
    #[test_case(" 11111111 , ", 1 ; "blank entries are skipped")]
    fn test_parse_part(raw: &str, expected: usize) {
        assert_eq!(parse_part(raw).unwrap().len(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("11111111,nope" ; "bad reference")]
    fn test_parse_part_rejects(raw: &str) {
        assert!(parse_part(raw).is_err());
    }
}
