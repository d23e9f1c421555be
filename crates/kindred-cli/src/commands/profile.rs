use anyhow::{bail, Result};
use kindred_core::{NewVisibilityProfile, ProfileType, VisibilityStore};

use super::Session;
use crate::cli::ProfileCommands;
use crate::output::{self, emit};

pub async fn execute(session: &Session, cmd: ProfileCommands) -> Result<()> {
    let visibility = &session.backend.visibility;
    match cmd {
        ProfileCommands::Create {
            name,
            description,
            collection,
            document,
            entity_types,
            relationship_types,
            hidden_entities,
            hidden_relationships,
            no_auto_include,
        } => {
            let collection_uuid = match collection {
                Some(id) => Some(session.collection(&id).await?.uuid),
                None => None,
            };
            let file_uuid = match document {
                Some(id) => Some(session.document(&id).await?.uuid),
                None => None,
            };
            let profile_type = match (collection_uuid, file_uuid) {
                (Some(_), _) => ProfileType::Collection,
                (None, Some(_)) => ProfileType::File,
                (None, None) => ProfileType::Global,
            };
            let profile = visibility
                .create_profile(NewVisibilityProfile {
                    name,
                    description,
                    owner: session.actor.clone(),
                    profile_type,
                    file_uuid,
                    collection_uuid,
                    visible_entity_types: entity_types,
                    visible_relationship_types: relationship_types,
                    hidden_entities,
                    hidden_relationships,
                    auto_include_new: !no_auto_include,
                })
                .await?;
            emit(session.format, &profile, |p| output::profiles(std::slice::from_ref(p)).to_string())
        }
        ProfileCommands::List { collection } => {
            let coll = session.collection(&collection).await?;
            let profiles = visibility.collection_profiles(coll.uuid).await?;
            emit(session.format, &profiles, |p| output::profiles(p).to_string())
        }
        ProfileCommands::Show { profile } => {
            let profile = session.profile(&profile).await?;
            emit(session.format, &profile, |p| output::profiles(std::slice::from_ref(p)).to_string())
        }
        ProfileCommands::Default {
            collection,
            profile,
            clear,
        } => {
            let coll = session.collection(&collection).await?;
            let profile = match (profile, clear) {
                (Some(id), false) => Some(session.profile(&id).await?.uuid),
                (None, true) => None,
                _ => bail!("pass a profile or --clear"),
            };
            let updated = visibility.set_default_profile(coll.uuid, profile).await?;
            emit(session.format, &updated, |c| output::collection(c).to_string())
        }
    }
}
