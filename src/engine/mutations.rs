use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, today};

impl Engine {
    // ── Service type catalog ─────────────────────────────

    pub async fn add_service_type(
        &self,
        name: String,
        duration_minutes: u32,
        notification_template: Option<String>,
    ) -> Result<ServiceType, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("service type name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service type name too long"));
        }
        if duration_minutes == 0 {
            return Err(EngineError::Validation("duration must be positive"));
        }
        if duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("duration exceeds one working day"));
        }
        if let Some(ref t) = notification_template
            && t.len() > MAX_TEMPLATE_LEN
        {
            return Err(EngineError::LimitExceeded("notification template too long"));
        }

        // Cap and uniqueness checks go under the ledger write lock: it
        // serializes every mutation, so the state they read cannot move
        // before the event is journaled.
        let mut ledger = self.ledger.write().await;
        if self.catalog.service_types.len() >= MAX_SERVICE_TYPES {
            return Err(EngineError::LimitExceeded("too many service types"));
        }
        if self
            .catalog
            .service_types
            .iter()
            .any(|e| e.value().name == name)
        {
            return Err(EngineError::AlreadyExists(name));
        }

        let st = ServiceType {
            id: Ulid::new(),
            name,
            duration_minutes,
            notification_template,
        };
        let event = Event::ServiceTypeCreated {
            id: st.id,
            name: st.name.clone(),
            duration_minutes: st.duration_minutes,
            notification_template: st.notification_template.clone(),
        };
        self.persist_and_apply(&mut ledger, None, &event).await?;
        Ok(st)
    }

    /// The only mutation allowed on a referenced service type.
    pub async fn update_notification_template(
        &self,
        id: Ulid,
        notification_template: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref t) = notification_template
            && t.len() > MAX_TEMPLATE_LEN
        {
            return Err(EngineError::LimitExceeded("notification template too long"));
        }
        let mut ledger = self.ledger.write().await;
        if !self.catalog.service_types.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ServiceTypeTemplateUpdated {
            id,
            notification_template,
        };
        self.persist_and_apply(&mut ledger, None, &event).await
    }

    /// Deletion is blocked while any appointment, scheduled or rejected,
    /// still references the type, so the ledger never dangles.
    pub async fn delete_service_type(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        if !self.catalog.service_types.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if ledger.references_service_type(&id) {
            return Err(EngineError::InUse(id));
        }
        let event = Event::ServiceTypeDeleted { id };
        self.persist_and_apply(&mut ledger, None, &event).await?;
        self.notify.remove(&id);
        Ok(())
    }

    // ── Recurring rules & exclusion days ─────────────────

    /// Invalid break bounds are accepted here and ignored at slot
    /// generation; every other malformed field is rejected before any
    /// mutation.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_rule(
        &self,
        day_of_week: u8,
        valid_from: NaiveDate,
        valid_to: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        break_start: Option<NaiveTime>,
        break_end: Option<NaiveTime>,
    ) -> Result<RecurringRule, EngineError> {
        if day_of_week > 4 {
            return Err(EngineError::Validation(
                "day of week must be 0 (Monday) through 4 (Friday)",
            ));
        }
        if valid_from > valid_to {
            return Err(EngineError::Validation("valid_from must not be after valid_to"));
        }
        if start_time >= end_time {
            return Err(EngineError::Validation("start time must be before end time"));
        }
        let mut ledger = self.ledger.write().await;
        if self.catalog.rules.len() >= MAX_RULES {
            return Err(EngineError::LimitExceeded("too many rules"));
        }

        let rule = RecurringRule {
            id: Ulid::new(),
            day_of_week,
            valid_from,
            valid_to,
            start_time,
            end_time,
            break_start,
            break_end,
        };
        let event = Event::RuleAdded {
            id: rule.id,
            day_of_week,
            valid_from,
            valid_to,
            start_time,
            end_time,
            break_start,
            break_end,
        };
        self.persist_and_apply(&mut ledger, None, &event).await?;
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        if !self.catalog.rules.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id };
        self.persist_and_apply(&mut ledger, None, &event).await
    }

    pub async fn add_exclusion(
        &self,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<ExclusionDay, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("exclusion reason too long"));
        }
        let mut ledger = self.ledger.write().await;
        if self.catalog.exclusions.len() >= MAX_EXCLUSIONS {
            return Err(EngineError::LimitExceeded("too many exclusion days"));
        }
        if self.catalog.exclusions.contains_key(&date) {
            return Err(EngineError::AlreadyExists(date.to_string()));
        }

        let event = Event::ExclusionAdded {
            date,
            reason: reason.clone(),
        };
        self.persist_and_apply(&mut ledger, None, &event).await?;
        Ok(ExclusionDay { date, reason })
    }

    pub async fn remove_exclusion(&self, date: NaiveDate) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        if !self.catalog.exclusions.contains_key(&date) {
            return Err(EngineError::NoSuchExclusion(date));
        }
        let event = Event::ExclusionRemoved { date };
        self.persist_and_apply(&mut ledger, None, &event).await
    }

    // ── Booking committer ────────────────────────────────

    /// Commit one booking: parse, then under the ledger write lock
    /// re-validate the slot, allocate the next number, append durably,
    /// and apply. A storage-level uniqueness clash is retried from
    /// re-validation a bounded number of times before surfacing as
    /// `Conflict`.
    pub async fn book(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let slot: Slot = req
            .slot
            .parse()
            .map_err(|_| EngineError::InvalidSlot(req.slot.clone()))?;
        validate_customer(&req)?;

        let mut clashed = 0u32;
        for _ in 0..MAX_COMMIT_RETRIES {
            match self.try_commit(&req, slot).await {
                Err(EngineError::Conflict(number)) => {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    clashed = number;
                }
                Ok(appt) => {
                    metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
                    return Ok(appt);
                }
                Err(other) => return Err(other),
            }
        }
        Err(EngineError::Conflict(clashed))
    }

    /// One commit attempt. Holds the ledger write guard across
    /// re-validation, allocation, WAL append, and apply; this is the
    /// single mutual-exclusion point of the engine. Failing attempts
    /// write nothing.
    async fn try_commit(
        &self,
        req: &BookingRequest,
        slot: Slot,
    ) -> Result<Appointment, EngineError> {
        let mut ledger = self.ledger.write().await;

        let duration = self
            .catalog
            .service_types
            .get(&req.service_type_id)
            .map(|st| st.duration_minutes)
            .ok_or(EngineError::NotFound(req.service_type_id))?;

        // The slot must still be inside the horizon a fresh query would
        // cover, and still free on its day. Days are resolved
        // independently, so re-deriving this one day equals membership
        // in the full free-slot set.
        let origin = today();
        let horizon_end = origin.checked_add_days(Days::new(self.lookahead_days() as u64));
        if slot.date < origin || horizon_end.is_none_or(|end| slot.date > end) {
            return Err(EngineError::SlotNoLongerAvailable(slot));
        }
        let (rules, exclusions) = self.calendar_snapshot();
        let open = self.day_free_starts(&ledger, &rules, &exclusions, slot.date, duration);
        if !open.contains(&slot.time) {
            return Err(EngineError::SlotNoLongerAvailable(slot));
        }

        let number = ledger.next_number();
        if ledger.get_by_number(number).is_some() {
            // Uniqueness violation; the caller retries from re-validation.
            return Err(EngineError::Conflict(number));
        }

        let appt = Appointment {
            id: Ulid::new(),
            number,
            service_type_id: req.service_type_id,
            customer_name: req.customer_name.clone(),
            customer_email: req.customer_email.clone(),
            customer_birth_date: req.customer_birth_date,
            date: slot.date,
            time: slot.time,
            status: Status::Scheduled,
        };
        let event = Event::AppointmentBooked {
            id: appt.id,
            number: appt.number,
            service_type_id: appt.service_type_id,
            customer_name: appt.customer_name.clone(),
            customer_email: appt.customer_email.clone(),
            customer_birth_date: appt.customer_birth_date,
            date: appt.date,
            time: appt.time,
        };
        self.persist_and_apply(&mut ledger, Some(appt.service_type_id), &event)
            .await?;
        Ok(appt)
    }

    // ── Ledger administration ────────────────────────────

    /// Flip Scheduled to Rejected. Idempotent: rejecting twice is a no-op and
    /// journals nothing.
    pub async fn reject_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        let appt = ledger.get(&id).ok_or(EngineError::NotFound(id))?;
        if appt.status == Status::Rejected {
            return Ok(());
        }
        let route = Some(appt.service_type_id);
        let event = Event::AppointmentRejected { id };
        self.persist_and_apply(&mut ledger, route, &event).await
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ledger = self.ledger.write().await;
        let route = ledger
            .get(&id)
            .map(|a| a.service_type_id)
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::AppointmentDeleted { id };
        self.persist_and_apply(&mut ledger, Some(route), &event).await
    }

    /// Bulk retention: delete every appointment dated strictly before
    /// `threshold`. Returns how many were removed.
    pub async fn purge_appointments_before(
        &self,
        threshold: NaiveDate,
    ) -> Result<usize, EngineError> {
        let mut ledger = self.ledger.write().await;
        let victims: Vec<(Ulid, Ulid)> = ledger
            .iter()
            .filter(|a| a.date < threshold)
            .map(|a| (a.id, a.service_type_id))
            .collect();
        for (id, service_type_id) in &victims {
            let event = Event::AppointmentDeleted { id: *id };
            self.persist_and_apply(&mut ledger, Some(*service_type_id), &event)
                .await?;
        }
        Ok(victims.len())
    }

    /// First-run catalog seeding; a no-op once any service type exists.
    pub async fn seed_defaults(&self) -> Result<(), EngineError> {
        if !self.catalog.service_types.is_empty() {
            return Ok(());
        }
        self.add_service_type("Passport application".into(), 30, None)
            .await?;
        self.add_service_type("Document certification".into(), 20, None)
            .await?;
        Ok(())
    }
}

fn validate_customer(req: &BookingRequest) -> Result<(), EngineError> {
    if req.customer_name.trim().is_empty() {
        return Err(EngineError::Validation("customer name must not be empty"));
    }
    if req.customer_name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    if req.customer_email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("customer email too long"));
    }
    if !req.customer_email.contains('@') {
        return Err(EngineError::Validation("customer email must contain '@'"));
    }
    Ok(())
}
