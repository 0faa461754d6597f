//! Event append, query, and streaming endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use bridge_auth::{ScopeBase, ScopeTarget};
use bridge_hub::{Delivery, Subscription};
use bridge_types::{
    BridgeError, Event, EventDraft, EventFilter, EventId, EventKind, EventPayload, StreamId,
    SystemState, MAX_BATCH_LEN,
};

use crate::error::{ApiError, ApiResult};
use crate::extract::{Authed, Correlation};
use crate::GatewayState;

//─────────────────────────────
//  Append
//─────────────────────────────

/// One event to append.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendEvent {
    /// Target stream.
    pub stream_id: String,
    /// Typed payload (kind-tagged).
    pub payload: EventPayload,
    /// Optional causal parents.
    #[serde(default)]
    pub parents: Vec<EventId>,
    /// Optional session id.
    #[serde(default)]
    pub session: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    /// First assigned id.
    pub first_id: EventId,
    /// Last assigned id.
    pub last_id: EventId,
    /// Correlation the events were appended under.
    pub correlation: Uuid,
}

/// Kinds the gateway still accepts while the system is degraded.
fn is_recovery_control(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::SystemRecovering
            | EventKind::SystemRecovered
            | EventKind::IntegrityAlert
            | EventKind::SecurityEvent
    )
}

fn drafts_from(
    state: &GatewayState,
    ctx: &bridge_auth::AuthContext,
    correlation: Uuid,
    items: Vec<AppendEvent>,
) -> ApiResult<Vec<EventDraft>> {
    let system_state = state.controller.state();
    let mut drafts = Vec::with_capacity(items.len());
    for item in items {
        let stream = StreamId::raw(item.stream_id);
        state.authority.authorize(
            ctx,
            ScopeBase::EventsWrite,
            &ScopeTarget { agent: &ctx.agent, stream: Some(&stream) },
        )?;
        if system_state != SystemState::Normal && !is_recovery_control(item.payload.kind()) {
            return Err(ApiError(BridgeError::Degraded(format!(
                "writes refused while {system_state}"
            ))));
        }
        let mut draft = EventDraft::new(stream, item.payload, ctx.agent.clone())
            .with_correlation(correlation)
            .with_parents(item.parents);
        if let Some(session) = item.session {
            draft = draft.with_session(session);
        }
        drafts.push(draft);
    }
    Ok(drafts)
}

fn charge_write(state: &GatewayState, ctx: &bridge_auth::AuthContext) -> ApiResult<()> {
    state
        .authority
        .charge(&ctx.agent, bridge_auth::OpClass::EventsWrite)
        .map_err(ApiError::from)
}

/// `POST /events` – single event append.
pub async fn append_one(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(correlation): Correlation,
    Json(body): Json<AppendEvent>,
) -> ApiResult<Json<AppendResponse>> {
    // Authorize before charging: a forbidden or degraded-refused attempt
    // must not drain the caller's bucket.
    let drafts = drafts_from(&state, &ctx, correlation, vec![body])?;
    charge_write(&state, &ctx)?;
    let (first_id, last_id) = state.log.append(drafts).await?;
    Ok(Json(AppendResponse { first_id, last_id, correlation }))
}

/// `POST /events/batch` – atomic multi-event append.
pub async fn append_batch(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(correlation): Correlation,
    Json(body): Json<Vec<AppendEvent>>,
) -> ApiResult<Json<AppendResponse>> {
    if body.is_empty() || body.len() > MAX_BATCH_LEN {
        return Err(ApiError(BridgeError::SchemaViolation(format!(
            "batch size must be 1..={MAX_BATCH_LEN}"
        ))));
    }
    let drafts = drafts_from(&state, &ctx, correlation, body)?;
    charge_write(&state, &ctx)?;
    let (first_id, last_id) = state.log.append(drafts).await?;
    Ok(Json(AppendResponse { first_id, last_id, correlation }))
}

#[derive(Debug, Serialize)]
pub struct AsyncAccepted {
    /// Correlation to find the result under once it commits.
    pub correlation: Uuid,
}

/// `POST /events/async` – fire-and-forget append.
pub async fn append_async(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Correlation(correlation): Correlation,
    Json(body): Json<AppendEvent>,
) -> ApiResult<(StatusCode, Json<AsyncAccepted>)> {
    // Validate and authorize synchronously so the caller still gets input
    // errors; only the durability wait is deferred.
    let drafts = drafts_from(&state, &ctx, correlation, vec![body])?;
    for draft in &drafts {
        draft.validate()?;
    }
    charge_write(&state, &ctx)?;
    let log = state.log.clone();
    tokio::spawn(async move {
        if let Err(e) = log.append(drafts).await {
            warn!(error = %e, %correlation, "async append failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(AsyncAccepted { correlation })))
}

//─────────────────────────────
//  Read
//─────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    /// Resume strictly after this id.
    pub since: Option<EventId>,
    /// Stream prefix filter.
    pub stream: Option<String>,
    /// Kind filter (repeatable as comma-separated list).
    pub kind: Option<String>,
    /// Correlation filter.
    pub correlation: Option<Uuid>,
    /// Page size.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventPage {
    /// Matching events in id order.
    pub events: Vec<Event>,
    /// Cursor to pass as `since` for the next page.
    pub next: Option<EventId>,
}

pub(crate) fn parse_kinds(raw: &str) -> ApiResult<Vec<EventKind>> {
    raw.split(',')
        .map(|k| {
            serde_json::from_value(Value::String(k.trim().to_string()))
                .map_err(|_| ApiError(BridgeError::SchemaViolation(format!("unknown kind: {k}"))))
        })
        .collect()
}

fn authorize_read(
    state: &GatewayState,
    ctx: &bridge_auth::AuthContext,
    stream_prefix: Option<&str>,
) -> ApiResult<()> {
    // An unrestricted read spans every stream: model it as the empty
    // prefix, which only an `:all` qualifier satisfies.
    let stream = StreamId::raw(stream_prefix.unwrap_or(""));
    state
        .authority
        .authorize(
            ctx,
            ScopeBase::EventsRead,
            &ScopeTarget { agent: &ctx.agent, stream: Some(&stream) },
        )
        .map_err(ApiError::from)
}

fn filter_from(query: &ReadQuery) -> ApiResult<EventFilter> {
    Ok(EventFilter {
        stream_prefix: query.stream.clone(),
        kinds: query.kind.as_deref().map(parse_kinds).transpose()?,
        correlation: query.correlation,
        since: None,
    })
}

/// `GET /events` – cursor-paginated query.
pub async fn read_events(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Json<EventPage>> {
    authorize_read(&state, &ctx, query.stream.as_deref())?;
    let limit = query.limit.unwrap_or(100).min(1000);
    let filter = filter_from(&query)?;
    let events = state
        .log
        .read(query.since.unwrap_or(EventId::ZERO), limit, &filter)
        .await?;
    let next = if events.len() == limit { events.last().map(|e| e.id) } else { None };
    Ok(Json(EventPage { events, next }))
}

//─────────────────────────────
//  Structured query
//─────────────────────────────

/// Equality predicate over a dotted path into the payload data.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadPredicate {
    /// Dotted path, e.g. `verdict` or `context.elicitation`.
    pub path: String,
    /// Value the path must equal.
    pub equals: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct StructuredWhere {
    pub stream_prefix: Option<String>,
    #[serde(default)]
    pub kinds: Vec<EventKind>,
    pub correlation: Option<Uuid>,
    pub since: Option<EventId>,
    #[serde(default)]
    pub payload: Vec<PayloadPredicate>,
}

#[derive(Debug, Deserialize)]
pub struct StructuredQuery {
    #[serde(default, rename = "where")]
    pub where_: StructuredWhere,
    /// `id` (ascending, default) or `id_desc`.
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `POST /events/query` – structured query with payload predicates.
pub async fn query_events(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Json(query): Json<StructuredQuery>,
) -> ApiResult<Json<EventPage>> {
    authorize_read(&state, &ctx, query.where_.stream_prefix.as_deref())?;
    let descending = match query.order_by.as_deref() {
        None | Some("id") => false,
        Some("id_desc") => true,
        Some(other) => {
            return Err(ApiError(BridgeError::SchemaViolation(format!(
                "unsupported order_by: {other}"
            ))))
        }
    };
    let limit = query.limit.unwrap_or(100).min(1000);
    let offset = query.offset.unwrap_or(0);

    let filter = EventFilter {
        stream_prefix: query.where_.stream_prefix.clone(),
        kinds: (!query.where_.kinds.is_empty()).then(|| query.where_.kinds.clone()),
        correlation: query.where_.correlation,
        since: None,
    };

    // Scan pages, apply payload predicates, and stop once the requested
    // window is full.
    let mut matches = Vec::new();
    let mut cursor = query.where_.since.unwrap_or(EventId::ZERO);
    let wanted = offset + limit;
    loop {
        let page = state.log.read(cursor, 512, &filter).await?;
        if page.is_empty() {
            break;
        }
        cursor = page[page.len() - 1].id;
        for event in page {
            if payload_matches(&event, &query.where_.payload)? {
                matches.push(event);
            }
        }
        if !descending && matches.len() >= wanted {
            break;
        }
    }

    if descending {
        matches.reverse();
    }
    let events: Vec<Event> = matches.into_iter().skip(offset).take(limit).collect();
    let next = events.last().map(|e| e.id);
    Ok(Json(EventPage { events, next }))
}

fn payload_matches(event: &Event, predicates: &[PayloadPredicate]) -> ApiResult<bool> {
    if predicates.is_empty() {
        return Ok(true);
    }
    let value = serde_json::to_value(&event.payload)
        .map_err(|e| ApiError(BridgeError::Internal(format!("payload encode: {e}"))))?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Ok(predicates.iter().all(|p| {
        let mut current = &data;
        for segment in p.path.split('.') {
            match current.get(segment) {
                Some(v) => current = v,
                None => return false,
            }
        }
        *current == p.equals
    }))
}

//─────────────────────────────
//  Stream
//─────────────────────────────

/// `GET /events/stream` – filtered real-time subscription (SSE).
///
/// Resumable: pass `Last-Event-ID` (or `since`) and delivery continues
/// strictly after it, catch-up from the log first, live after, no gaps and
/// no duplicates. Hub backpressure is invisible to the client: a parked
/// subscription transparently resumes from its cursor.
pub async fn stream_events(
    State(state): State<Arc<GatewayState>>,
    Authed(ctx): Authed,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    authorize_read(&state, &ctx, query.stream.as_deref())?;
    let filter = filter_from(&query)?;

    let cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(query.since)
        .unwrap_or(EventId::ZERO);

    let sub = state.hub.resume(filter.clone(), cursor).await?;
    let hub = state.hub.clone();

    struct StreamState {
        sub: Subscription,
        hub: bridge_hub::SubscriptionHub,
        filter: EventFilter,
    }

    let stream = futures::stream::unfold(
        StreamState { sub, hub, filter },
        |mut st| async move {
            loop {
                match st.sub.next().await {
                    Some(Delivery::Event(event)) => {
                        let data = match serde_json::to_string(&event) {
                            Ok(data) => data,
                            Err(e) => {
                                warn!(error = %e, "failed to encode stream event");
                                continue;
                            }
                        };
                        let sse = SseEvent::default()
                            .id(event.id.to_string())
                            .event(event.kind().as_str())
                            .data(data);
                        return Some((Ok(sse), st));
                    }
                    Some(Delivery::Lagged { resume_from }) => {
                        match st.hub.resume(st.filter.clone(), resume_from).await {
                            Ok(sub) => st.sub = sub,
                            Err(e) => {
                                warn!(error = %e, "stream resume failed");
                                return None;
                            }
                        }
                    }
                    None => return None,
                }
            }
        },
    );
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
