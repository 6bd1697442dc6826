//! Request guards for pages that need a signed-in user, a selected company
//! or a particular role.

use actix_identity::Identity;
use actix_session::Session;
use actix_web::{HttpRequest, HttpResponse};

use crate::{
    bootstrap::{self, AuthState, GuardDecision, GuardInput, TenantsState},
    errors::AppError,
    session::{self, CurrentCompany},
    structs::{Company, Role},
    AppState,
};

/// Where to send the user after logging in.
pub const RETURN_TO: &str = "returnTo";

pub const DEFAULT_FALLBACK: &str = "/dashboard";

/// Outcome of a guard: carry on with `T`, or answer with a redirect.
pub enum Gate<T> {
    Open(T),
    Redirect(HttpResponse),
}

#[derive(Debug, Clone)]
pub struct CompanyContext {
    pub user_id: i64,
    pub company: Company,
    pub role: String,
}

impl CompanyContext {
    pub fn role(&self) -> Option<Role> {
        self.role.parse().ok()
    }
}

pub fn see_other(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .append_header(("Location", location))
        .finish()
}

fn origin(req: &HttpRequest) -> String {
    match req.uri().path_and_query() {
        Some(pq) => pq.as_str().to_owned(),
        None => req.path().to_owned(),
    }
}

/// Company bootstrap result before it is turned into a page response.
pub enum CompanyGate {
    Ready(CompanyContext),
    /// The user's only company was just persisted to the session.
    AutoSelected(CompanyContext),
    Redirect(HttpResponse),
}

fn auth_state(identity: Option<&Identity>) -> Result<AuthState, AppError> {
    Ok(match session::user_id(identity)? {
        Some(user_id) => AuthState::SignedIn(user_id),
        None => AuthState::SignedOut,
    })
}

/// Answers a decision that needs no company list: loading or signed out.
fn pre_company_response(decision: GuardDecision, session: &Session) -> Result<HttpResponse, AppError> {
    match decision {
        GuardDecision::RedirectToLogin { return_to } => {
            session.insert(RETURN_TO, return_to)?;
            Ok(see_other("/login"))
        }
        _ => Ok(HttpResponse::ServiceUnavailable()
            .append_header(("Retry-After", "1"))
            .body("Loading")),
    }
}

/// Signed-in user or a redirect to the login page that remembers `req`'s path.
pub fn require_user(
    req: &HttpRequest,
    identity: Option<&Identity>,
    session: &Session,
) -> Result<Gate<i64>, AppError> {
    let auth = auth_state(identity)?;
    if let AuthState::SignedIn(user_id) = auth {
        return Ok(Gate::Open(user_id));
    }
    let path = origin(req);
    let decision = bootstrap::decide(GuardInput {
        auth: &auth,
        tenants: &TenantsState::Loading,
        selected_id: None,
        refresh_attempted: false,
        path: &path,
    });
    Ok(Gate::Redirect(pre_company_response(decision, session)?))
}

/// Runs the company bootstrap for the current request and applies its
/// session side effects.
pub async fn resolve_company_context(
    req: &HttpRequest,
    state: &AppState,
    identity: Option<&Identity>,
    session: &Session,
) -> Result<CompanyGate, AppError> {
    let user_id = match require_user(req, identity, session)? {
        Gate::Open(user_id) => user_id,
        Gate::Redirect(resp) => return Ok(CompanyGate::Redirect(resp)),
    };

    let cached = session::current_company(session)?;
    let path = origin(req);
    let decision = bootstrap::resolve_company(
        &state.db_pool,
        user_id,
        cached.as_ref().map(|c| c.id),
        &path,
        state.config.timers,
    )
    .await?;

    match decision {
        GuardDecision::Render(member) => {
            if cached.as_ref() != Some(&CurrentCompany::from(&member.company)) {
                session::select_company(session, &member.company)?;
            }
            Ok(CompanyGate::Ready(CompanyContext {
                user_id,
                company: member.company,
                role: member.role,
            }))
        }
        GuardDecision::AutoSelect(member) => {
            log::info!(
                "Auto-selecting company {} for user {}",
                member.company.id,
                user_id
            );
            session::select_company(session, &member.company)?;
            Ok(CompanyGate::AutoSelected(CompanyContext {
                user_id,
                company: member.company,
                role: member.role,
            }))
        }
        GuardDecision::RedirectToSelection { notice } => {
            if cached.is_some() {
                session::clear_company(session);
            }
            let location = match notice {
                Some(notice) => format!("/select-company?notice={}", notice.code()),
                None => "/select-company".to_owned(),
            };
            Ok(CompanyGate::Redirect(see_other(&location)))
        }
        other @ (GuardDecision::RedirectToLogin { .. }
        | GuardDecision::ShowLoading
        | GuardDecision::RefreshTenants) => {
            Ok(CompanyGate::Redirect(pre_company_response(other, session)?))
        }
    }
}

/// Signed-in user with a selected company they still belong to. A freshly
/// auto-selected company sends the user to the dashboard first.
pub async fn require_company(
    req: &HttpRequest,
    state: &AppState,
    identity: Option<&Identity>,
    session: &Session,
) -> Result<Gate<CompanyContext>, AppError> {
    Ok(match resolve_company_context(req, state, identity, session).await? {
        CompanyGate::Ready(ctx) => Gate::Open(ctx),
        CompanyGate::AutoSelected(_) => Gate::Redirect(see_other("/dashboard")),
        CompanyGate::Redirect(resp) => Gate::Redirect(resp),
    })
}

/// Narrows an established company context by role.
pub fn require_role(ctx: &CompanyContext, allowed: &[Role], fallback: Option<&str>) -> Gate<()> {
    match ctx.role() {
        Some(role) if allowed.contains(&role) => Gate::Open(()),
        _ => {
            log::warn!(
                "User {} with role {} denied, needs one of {:?}",
                ctx.user_id,
                ctx.role,
                allowed
            );
            Gate::Redirect(see_other(fallback.unwrap_or(DEFAULT_FALLBACK)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::{header, StatusCode};

    fn ctx(role: &str) -> CompanyContext {
        CompanyContext {
            user_id: 1,
            company: Company {
                id: 1,
                name: "Acme".into(),
                slug: "acme".into(),
                logo_url: None,
                address: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            role: role.into(),
        }
    }

    fn location(gate: Gate<()>) -> Option<String> {
        match gate {
            Gate::Open(()) => None,
            Gate::Redirect(resp) => {
                assert_eq!(resp.status(), StatusCode::SEE_OTHER);
                resp.headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            }
        }
    }

    #[test]
    fn allowed_role_passes() {
        let gate = require_role(&ctx("manager"), &[Role::Admin, Role::Manager], None);
        assert_eq!(location(gate), None);
    }

    #[test]
    fn other_roles_go_to_the_dashboard_by_default() {
        let gate = require_role(&ctx("front_of_house"), &[Role::Admin], None);
        assert_eq!(location(gate).as_deref(), Some("/dashboard"));
    }

    #[test]
    fn fallback_is_configurable() {
        let gate = require_role(&ctx("instructor"), &[Role::Founder], Some("/rota"));
        assert_eq!(location(gate).as_deref(), Some("/rota"));
    }

    #[test]
    fn unknown_role_strings_are_denied() {
        let gate = require_role(&ctx("owner"), &Role::ALL, None);
        assert_eq!(location(gate).as_deref(), Some("/dashboard"));
    }
}
