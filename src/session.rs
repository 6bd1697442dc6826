use actix_identity::Identity;
use actix_session::Session;
use serde::Serialize;

use crate::{errors::AppError, structs::Company};

pub const CURRENT_COMPANY_SLUG: &str = "currentCompanySlug";
pub const CURRENT_COMPANY_ID: &str = "currentCompanyId";
pub const CURRENT_COMPANY_NAME: &str = "currentCompanyName";

/// Cached pointer to the company the user last picked. It is only a hint:
/// guards always re-check it against the membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentCompany {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

impl From<&Company> for CurrentCompany {
    fn from(company: &Company) -> Self {
        CurrentCompany {
            id: company.id,
            slug: company.slug.clone(),
            name: company.name.clone(),
        }
    }
}

pub fn current_company(session: &Session) -> Result<Option<CurrentCompany>, AppError> {
    let Some(id) = session.get::<i64>(CURRENT_COMPANY_ID)? else {
        return Ok(None);
    };
    Ok(Some(CurrentCompany {
        id,
        slug: session.get::<String>(CURRENT_COMPANY_SLUG)?.unwrap_or_default(),
        name: session.get::<String>(CURRENT_COMPANY_NAME)?.unwrap_or_default(),
    }))
}

pub fn select_company(session: &Session, company: &Company) -> Result<(), AppError> {
    session.insert(CURRENT_COMPANY_ID, company.id)?;
    session.insert(CURRENT_COMPANY_SLUG, &company.slug)?;
    session.insert(CURRENT_COMPANY_NAME, &company.name)?;
    log::debug!("Selected company {} ({})", company.id, company.slug);
    Ok(())
}

pub fn clear_company(session: &Session) {
    session.remove(CURRENT_COMPANY_ID);
    session.remove(CURRENT_COMPANY_SLUG);
    session.remove(CURRENT_COMPANY_NAME);
}

/// The signed-in user's id, if there is one and it parses.
pub fn user_id(identity: Option<&Identity>) -> Result<Option<i64>, AppError> {
    let Some(identity) = identity else {
        return Ok(None);
    };
    let id = identity.id()?;
    match id.parse::<i64>() {
        Ok(id) => Ok(Some(id)),
        Err(_) => {
            log::warn!("Ignoring identity with non-numeric id: {}", id);
            Ok(None)
        }
    }
}
