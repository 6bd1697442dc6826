//! Session and company bootstrapping for guarded pages.
//!
//! [`decide`] is the pure transition function. [`resolve_company`] drives it
//! for a signed-in user: it fetches memberships, re-checks once after
//! `tenant_refresh_wait` when the list comes back empty (new sign-ups can
//! lag behind their membership row), and gives up with a stalled notice once
//! `loading_ceiling` has passed. Dropping the returned future cancels every
//! pending timer, so an abandoned request never produces a redirect.

use std::{future::Future, time::Duration};

use sqlx::SqlitePool;
use tokio::time::{sleep, timeout};

use crate::{db, errors::AppError, structs::MemberCompany};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardTimers {
    pub tenant_refresh_wait: Duration,
    pub loading_ceiling: Duration,
}

impl Default for GuardTimers {
    fn default() -> Self {
        GuardTimers {
            tenant_refresh_wait: Duration::from_secs(2),
            loading_ceiling: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Identity not resolved yet. Server requests arrive with the session
    /// already read, so only asynchronous callers ever start here.
    #[cfg_attr(not(test), allow(dead_code))]
    Loading,
    SignedOut,
    SignedIn(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantsState {
    Loading,
    Loaded(Vec<MemberCompany>),
}

/// Message shown on the company selection page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NoCompany,
    LoadingStalled,
}

impl Notice {
    pub fn code(&self) -> &'static str {
        match self {
            Notice::NoCompany => "no-company",
            Notice::LoadingStalled => "stalled",
        }
    }

    pub fn from_code(code: &str) -> Option<Notice> {
        match code {
            "no-company" => Some(Notice::NoCompany),
            "stalled" => Some(Notice::LoadingStalled),
            _ => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Notice::NoCompany => {
                "You are not a member of any company yet. Create one to get started."
            }
            Notice::LoadingStalled => "Loading your companies took too long. Please pick one below.",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub auth: &'a AuthState,
    pub tenants: &'a TenantsState,
    pub selected_id: Option<i64>,
    pub refresh_attempted: bool,
    pub path: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    ShowLoading,
    RedirectToLogin { return_to: String },
    RefreshTenants,
    RedirectToSelection { notice: Option<Notice> },
    /// The only company, not yet selected. Persist it and go to the dashboard.
    AutoSelect(MemberCompany),
    Render(MemberCompany),
}

pub fn decide(input: GuardInput<'_>) -> GuardDecision {
    match input.auth {
        AuthState::Loading => return GuardDecision::ShowLoading,
        AuthState::SignedOut => {
            return GuardDecision::RedirectToLogin {
                return_to: input.path.to_owned(),
            }
        }
        AuthState::SignedIn(_) => {}
    }

    let companies = match input.tenants {
        TenantsState::Loading => return GuardDecision::ShowLoading,
        TenantsState::Loaded(companies) => companies,
    };

    let selected = input
        .selected_id
        .and_then(|id| companies.iter().find(|c| c.company.id == id));

    match (companies.as_slice(), selected) {
        ([], _) if !input.refresh_attempted => GuardDecision::RefreshTenants,
        ([], _) => GuardDecision::RedirectToSelection {
            notice: Some(Notice::NoCompany),
        },
        (_, Some(company)) => GuardDecision::Render(company.clone()),
        ([only], None) => GuardDecision::AutoSelect(only.clone()),
        (_, None) => GuardDecision::RedirectToSelection { notice: None },
    }
}

pub trait CompanyDirectory {
    fn companies_for_user(
        &self,
        user_id: i64,
    ) -> impl Future<Output = Result<Vec<MemberCompany>, AppError>>;
}

impl CompanyDirectory for SqlitePool {
    async fn companies_for_user(&self, user_id: i64) -> Result<Vec<MemberCompany>, AppError> {
        db::companies_for_user(self, user_id).await.map_err(|e| {
            log::error!("Failed to list companies for user {}: {}", user_id, e);
            AppError::DatabaseError(e)
        })
    }
}

pub async fn resolve_company<D: CompanyDirectory>(
    directory: &D,
    user_id: i64,
    selected_id: Option<i64>,
    path: &str,
    timers: GuardTimers,
) -> Result<GuardDecision, AppError> {
    let auth = AuthState::SignedIn(user_id);

    let work = async {
        let mut refresh_attempted = false;
        let mut tenants = TenantsState::Loaded(directory.companies_for_user(user_id).await?);
        loop {
            let decision = decide(GuardInput {
                auth: &auth,
                tenants: &tenants,
                selected_id,
                refresh_attempted,
                path,
            });
            if decision != GuardDecision::RefreshTenants {
                return Ok::<_, AppError>(decision);
            }
            log::info!(
                "User {} has no companies yet, re-checking in {:?}",
                user_id,
                timers.tenant_refresh_wait
            );
            refresh_attempted = true;
            sleep(timers.tenant_refresh_wait).await;
            tenants = TenantsState::Loaded(directory.companies_for_user(user_id).await?);
        }
    };

    match timeout(timers.loading_ceiling, work).await {
        Ok(decision) => decision,
        Err(_) => {
            log::warn!(
                "Company bootstrap for user {} exceeded {:?}",
                user_id,
                timers.loading_ceiling
            );
            Ok(GuardDecision::RedirectToSelection {
                notice: Some(Notice::LoadingStalled),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::structs::Company;

    fn member(id: i64, role: &str) -> MemberCompany {
        MemberCompany {
            company: Company {
                id,
                name: format!("Company {}", id),
                slug: format!("company-{}", id),
                logo_url: None,
                address: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
            role: role.to_owned(),
        }
    }

    fn input<'a>(auth: &'a AuthState, tenants: &'a TenantsState) -> GuardInput<'a> {
        GuardInput {
            auth,
            tenants,
            selected_id: None,
            refresh_attempted: false,
            path: "/rota",
        }
    }

    /// Hands out queued responses, repeating the last one.
    struct FakeDirectory {
        responses: Mutex<VecDeque<Vec<MemberCompany>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeDirectory {
        fn new(responses: Vec<Vec<MemberCompany>>) -> Self {
            FakeDirectory {
                responses: Mutex::new(responses.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CompanyDirectory for FakeDirectory {
        async fn companies_for_user(&self, _user_id: i64) -> Result<Vec<MemberCompany>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.pop_front().unwrap_or_default()
            } else {
                responses.front().cloned().unwrap_or_default()
            };
            Ok(next)
        }
    }

    #[test]
    fn auth_loading_shows_loading() {
        let tenants = TenantsState::Loading;
        assert_eq!(decide(input(&AuthState::Loading, &tenants)), GuardDecision::ShowLoading);
    }

    #[test]
    fn signed_out_redirects_to_login_with_origin() {
        let tenants = TenantsState::Loading;
        assert_eq!(
            decide(input(&AuthState::SignedOut, &tenants)),
            GuardDecision::RedirectToLogin {
                return_to: "/rota".into()
            }
        );
    }

    #[test]
    fn tenants_loading_shows_loading() {
        let tenants = TenantsState::Loading;
        assert_eq!(decide(input(&AuthState::SignedIn(1), &tenants)), GuardDecision::ShowLoading);
    }

    #[test]
    fn empty_list_refreshes_once_then_redirects() {
        let auth = AuthState::SignedIn(1);
        let tenants = TenantsState::Loaded(vec![]);
        assert_eq!(decide(input(&auth, &tenants)), GuardDecision::RefreshTenants);

        let mut after_refresh = input(&auth, &tenants);
        after_refresh.refresh_attempted = true;
        assert_eq!(
            decide(after_refresh),
            GuardDecision::RedirectToSelection {
                notice: Some(Notice::NoCompany)
            }
        );
    }

    #[test]
    fn single_company_is_auto_selected() {
        let auth = AuthState::SignedIn(1);
        let tenants = TenantsState::Loaded(vec![member(7, "manager")]);
        assert_eq!(decide(input(&auth, &tenants)), GuardDecision::AutoSelect(member(7, "manager")));

        let mut selected = input(&auth, &tenants);
        selected.selected_id = Some(7);
        assert_eq!(decide(selected), GuardDecision::Render(member(7, "manager")));
    }

    #[test]
    fn stale_selection_on_single_company_auto_selects_the_real_one() {
        let auth = AuthState::SignedIn(1);
        let tenants = TenantsState::Loaded(vec![member(7, "manager")]);
        let mut stale = input(&auth, &tenants);
        stale.selected_id = Some(99);
        assert_eq!(decide(stale), GuardDecision::AutoSelect(member(7, "manager")));
    }

    #[test]
    fn several_companies_need_a_choice() {
        let auth = AuthState::SignedIn(1);
        let tenants = TenantsState::Loaded(vec![member(1, "admin"), member(2, "instructor")]);
        assert_eq!(
            decide(input(&auth, &tenants)),
            GuardDecision::RedirectToSelection { notice: None }
        );

        let mut chosen = input(&auth, &tenants);
        chosen.selected_id = Some(2);
        assert_eq!(decide(chosen), GuardDecision::Render(member(2, "instructor")));

        let mut gone = input(&auth, &tenants);
        gone.selected_id = Some(3);
        assert_eq!(decide(gone), GuardDecision::RedirectToSelection { notice: None });
    }

    #[test]
    fn notice_codes_round_trip() {
        for notice in [Notice::NoCompany, Notice::LoadingStalled] {
            assert_eq!(Notice::from_code(notice.code()), Some(notice));
        }
        assert_eq!(Notice::from_code("other"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn one_membership_resolves_without_waiting() {
        let dir = FakeDirectory::new(vec![vec![member(4, "front_of_house")]]);
        let decision = resolve_company(&dir, 1, None, "/dashboard", GuardTimers::default())
            .await
            .unwrap();
        assert_eq!(decision, GuardDecision::AutoSelect(member(4, "front_of_house")));
        assert_eq!(dir.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_memberships_redirect_after_single_recheck() {
        let dir = FakeDirectory::new(vec![vec![]]);
        let started = tokio::time::Instant::now();
        let decision = resolve_company(&dir, 1, None, "/dashboard", GuardTimers::default())
            .await
            .unwrap();
        assert_eq!(
            decision,
            GuardDecision::RedirectToSelection {
                notice: Some(Notice::NoCompany)
            }
        );
        assert_eq!(dir.calls(), 2);
        assert!(started.elapsed() >= GuardTimers::default().tenant_refresh_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_picks_up_a_late_membership() {
        let dir = FakeDirectory::new(vec![vec![], vec![member(5, "admin")]]);
        let decision = resolve_company(&dir, 1, None, "/dashboard", GuardTimers::default())
            .await
            .unwrap();
        assert_eq!(decision, GuardDecision::AutoSelect(member(5, "admin")));
    }

    #[tokio::test(start_paused = true)]
    async fn no_decision_while_fetch_is_in_flight() {
        let dir = FakeDirectory::new(vec![vec![]]).with_delay(Duration::from_secs(1));
        let fut = resolve_company(&dir, 1, None, "/dashboard", GuardTimers::default());
        tokio::pin!(fut);

        assert!(timeout(Duration::from_millis(500), &mut fut).await.is_err());
        assert_eq!(dir.calls(), 1);

        let decision = fut.await.unwrap();
        assert!(matches!(decision, GuardDecision::RedirectToSelection { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_breaks_a_stuck_fetch() {
        let dir = FakeDirectory::new(vec![vec![member(1, "admin")]]).with_delay(Duration::from_secs(60));
        let timers = GuardTimers::default();
        let decision = resolve_company(&dir, 1, None, "/dashboard", timers).await.unwrap();
        assert_eq!(
            decision,
            GuardDecision::RedirectToSelection {
                notice: Some(Notice::LoadingStalled)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_before_the_recheck_cancels_it() {
        let dir = FakeDirectory::new(vec![vec![], vec![member(5, "admin")]]);
        {
            let fut = resolve_company(&dir, 1, None, "/dashboard", GuardTimers::default());
            tokio::pin!(fut);
            assert!(timeout(Duration::from_millis(100), &mut fut).await.is_err());
            assert_eq!(dir.calls(), 1);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(dir.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn previous_selection_is_kept_among_many() {
        let dir = FakeDirectory::new(vec![vec![member(1, "admin"), member(2, "manager")]]);
        let decision = resolve_company(&dir, 1, Some(2), "/dashboard", GuardTimers::default())
            .await
            .unwrap();
        assert_eq!(decision, GuardDecision::Render(member(2, "manager")));
    }
}
