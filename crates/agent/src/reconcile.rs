//! Request content reconciliation.
//!
//! Repairs the pairing between `functionCall` parts in model turns and the
//! `functionResponse` parts that answer them, so the history sent to the
//! backend always satisfies "every call has exactly one response before the
//! next model turn".
//!
//! Matching rules:
//! - a response matches a call from an earlier turn with the same id;
//! - when either side lacks an id, the response matches by tool name, but
//!   only after every exact-id pair has been bound;
//! - two different ids never match;
//! - among candidate calls, the nearest preceding unanswered one wins.
//!
//! When a call has several candidate responses, a real result beats the
//! `{"result": "user cancel"}` placeholder regardless of order, otherwise the
//! earliest one is kept. Unanswered calls get a placeholder in a new turn
//! right after the issuing turn. Orphaned and duplicate responses are
//! dropped. [`reconcile`] is pure; callers log the returned report.

use rustc_hash::FxHashMap;
use serde::Serialize;
use turnwright_core::content::{Content, FunctionCall, FunctionResponse, Part, Role};

/// Identifies a call or response in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartRef {
    pub name: String,
    pub id: Option<String>,
}

impl PartRef {
    fn of_call(call: &FunctionCall) -> Self {
        Self {
            name: call.name.clone(),
            id: call.id.clone(),
        }
    }

    fn of_response(response: &FunctionResponse) -> Self {
        Self {
            name: response.name.clone(),
            id: response.id.clone(),
        }
    }
}

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Calls that received a synthesized cancellation placeholder.
    pub synthesized: Vec<PartRef>,
    /// Responses with no matching call.
    pub orphaned: Vec<PartRef>,
    /// Responses that lost arbitration to another response for the same call.
    pub duplicates: Vec<PartRef>,
    /// Kept responses moved next to their call.
    pub relocated: usize,
    /// Kept responses whose id was rewritten to the call's id.
    pub realigned: usize,
    /// Turns whose parts were reordered to put responses first.
    pub reordered_turns: usize,
}

impl ReconcileReport {
    /// True when the history needed no repair.
    pub fn is_clean(&self) -> bool {
        self.synthesized.is_empty()
            && self.orphaned.is_empty()
            && self.duplicates.is_empty()
            && self.relocated == 0
            && self.realigned == 0
            && self.reordered_turns == 0
    }

    /// Number of responses removed from the history.
    pub fn dropped(&self) -> usize {
        self.orphaned.len() + self.duplicates.len()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub history: Vec<Content>,
    pub report: ReconcileReport,
}

type Loc = (usize, usize);

struct CallSlot<'a> {
    turn: usize,
    call: &'a FunctionCall,
    /// Turn index of the next model turn after `turn`.
    window_end: usize,
    answer: Option<Loc>,
}

impl CallSlot<'_> {
    fn in_window(&self, turn: usize) -> bool {
        turn > self.turn && turn < self.window_end
    }
}

enum Fate {
    Keep(usize),
    Orphan,
    Duplicate,
}

/// Nearest preceding call satisfying `pred`; first in its turn.
fn nearest<'a>(calls: &[CallSlot<'a>], pred: impl Fn(&CallSlot<'a>) -> bool) -> Option<usize> {
    let turn = calls.iter().filter(|c| pred(c)).map(|c| c.turn).max()?;
    calls.iter().position(|c| c.turn == turn && pred(c))
}

fn matches_id(slot: &CallSlot<'_>, response: &FunctionResponse, turn: usize) -> bool {
    slot.turn < turn
        && response.id.is_some()
        && slot.call.id.as_deref() == response.id.as_deref()
}

fn matches_name(slot: &CallSlot<'_>, response: &FunctionResponse, turn: usize) -> bool {
    slot.turn < turn
        && slot.call.name == response.name
        && (slot.call.id.is_none() || response.id.is_none())
}

/// Exact-id match, preferring an unanswered call.
fn find_call_by_id(calls: &[CallSlot<'_>], response: &FunctionResponse, turn: usize) -> Option<usize> {
    nearest(calls, |c| matches_id(c, response, turn) && c.answer.is_none())
        .or_else(|| nearest(calls, |c| matches_id(c, response, turn)))
}

/// Name match for id-less pairs, preferring an unanswered call.
fn find_call_by_name(calls: &[CallSlot<'_>], response: &FunctionResponse, turn: usize) -> Option<usize> {
    nearest(calls, |c| matches_name(c, response, turn) && c.answer.is_none())
        .or_else(|| nearest(calls, |c| matches_name(c, response, turn)))
}

/// Give the response at `loc` to call `idx`, arbitrating against any
/// response the call already holds.
fn bind(
    history: &[Content],
    calls: &mut [CallSlot<'_>],
    fates: &mut FxHashMap<Loc, Fate>,
    report: &mut ReconcileReport,
    idx: usize,
    loc: Loc,
    response: &FunctionResponse,
) {
    let held = calls[idx]
        .answer
        .and_then(|prev| response_at(history, prev).map(|r| (prev, r)));
    match held {
        None => {
            calls[idx].answer = Some(loc);
            fates.insert(loc, Fate::Keep(idx));
        }
        Some((prev, kept)) if kept.is_cancel_placeholder() && !response.is_cancel_placeholder() => {
            report.duplicates.push(PartRef::of_response(kept));
            fates.insert(prev, Fate::Duplicate);
            calls[idx].answer = Some(loc);
            fates.insert(loc, Fate::Keep(idx));
        }
        Some(_) => {
            report.duplicates.push(PartRef::of_response(response));
            fates.insert(loc, Fate::Duplicate);
        }
    }
}

fn response_at(history: &[Content], (turn, part): Loc) -> Option<&FunctionResponse> {
    history.get(turn)?.parts.get(part)?.as_function_response()
}

/// Rewrite the response id to the call's id. Returns whether it changed.
fn aligned(response: &FunctionResponse, call: &FunctionCall) -> (FunctionResponse, bool) {
    let mut response = response.clone();
    let changed = response.id != call.id;
    response.id = call.id.clone();
    (response, changed)
}

/// Repair the call/response pairing of `history`.
pub fn reconcile(history: &[Content]) -> Reconciled {
    let mut report = ReconcileReport::default();

    // Index every call with the window in which it must be answered.
    let mut calls: Vec<CallSlot<'_>> = Vec::new();
    for (i, turn) in history.iter().enumerate() {
        if turn.role != Role::Model {
            continue;
        }
        let window_end = history
            .iter()
            .enumerate()
            .skip(i + 1)
            .find(|(_, t)| t.role == Role::Model)
            .map_or(history.len(), |(k, _)| k);
        calls.extend(turn.function_calls().map(|call| CallSlot {
            turn: i,
            call,
            window_end,
            answer: None,
        }));
    }

    // Decide the fate of every response. Exact ids bind first so a name
    // match cannot take a call whose own response comes later.
    let responses: Vec<(Loc, &FunctionResponse)> = history
        .iter()
        .enumerate()
        .flat_map(|(k, turn)| {
            turn.parts
                .iter()
                .enumerate()
                .filter_map(move |(j, part)| part.as_function_response().map(|r| ((k, j), r)))
        })
        .collect();

    let mut fates: FxHashMap<Loc, Fate> = FxHashMap::default();
    for &(loc, response) in &responses {
        if let Some(idx) = find_call_by_id(&calls, response, loc.0) {
            bind(history, &mut calls, &mut fates, &mut report, idx, loc, response);
        }
    }
    for &(loc, response) in &responses {
        if fates.contains_key(&loc) {
            continue;
        }
        match find_call_by_name(&calls, response, loc.0) {
            Some(idx) => bind(history, &mut calls, &mut fates, &mut report, idx, loc, response),
            None => {
                report.orphaned.push(PartRef::of_response(response));
                fates.insert(loc, Fate::Orphan);
            }
        }
    }

    // Rebuild the history.
    let mut out: Vec<Content> = Vec::with_capacity(history.len() + 1);
    let mut carried: Vec<Part> = Vec::new();
    for (i, turn) in history.iter().enumerate() {
        let mut parts: Vec<Part> = Vec::with_capacity(turn.parts.len());
        for (j, part) in turn.parts.iter().enumerate() {
            let Part::FunctionResponse(response) = part else {
                parts.push(part.clone());
                continue;
            };
            match fates.get(&(i, j)) {
                Some(Fate::Keep(idx)) if calls[*idx].in_window(i) => {
                    let (response, changed) = aligned(response, calls[*idx].call);
                    if changed {
                        report.realigned += 1;
                    }
                    parts.push(Part::FunctionResponse(response));
                }
                Some(_) | None => {}
            }
        }
        parts.append(&mut carried);

        if !parts.is_empty() || turn.parts.is_empty() {
            out.push(Content::new(turn.role, parts));
        }

        if turn.role != Role::Model {
            continue;
        }

        // Calls of this turn not answered inside their window.
        let mut missing = Vec::new();
        for slot in calls.iter().filter(|c| c.turn == i) {
            match slot.answer {
                Some(loc) if slot.in_window(loc.0) => {}
                Some(loc) => {
                    if let Some(response) = response_at(history, loc) {
                        let (response, changed) = aligned(response, slot.call);
                        if changed {
                            report.realigned += 1;
                        }
                        report.relocated += 1;
                        missing.push(Part::FunctionResponse(response));
                    }
                }
                None => {
                    report.synthesized.push(PartRef::of_call(slot.call));
                    missing.push(Part::FunctionResponse(FunctionResponse::cancelled(
                        slot.call.name.clone(),
                        slot.call.id.clone(),
                    )));
                }
            }
        }
        if missing.is_empty() {
            continue;
        }

        // Join the next turn when it already answers part of this batch.
        let next_answers_here = history.get(i + 1).is_some_and(|next| next.role == Role::User)
            && calls
                .iter()
                .filter(|c| c.turn == i)
                .any(|c| c.answer.is_some_and(|(t, _)| t == i + 1));
        if next_answers_here {
            carried = missing;
        } else {
            out.push(Content::user(missing));
        }
    }

    for turn in &mut out {
        if responses_first(turn) {
            report.reordered_turns += 1;
        }
    }

    Reconciled {
        history: out,
        report,
    }
}

/// Move `functionResponse` parts ahead of other parts in a mixed turn.
/// Returns whether the order changed.
fn responses_first(turn: &mut Content) -> bool {
    let first_other = turn.parts.iter().position(|p| !p.is_function_response());
    let needs_move = first_other.is_some_and(|pos| {
        turn.parts[pos..].iter().any(Part::is_function_response)
    });
    if !needs_move {
        return false;
    }
    let (mut responses, others): (Vec<Part>, Vec<Part>) = std::mem::take(&mut turn.parts)
        .into_iter()
        .partition(Part::is_function_response);
    responses.extend(others);
    turn.parts = responses;
    true
}
