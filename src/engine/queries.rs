use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Appointment, ExclusionDay, RecurringRule, ServiceType};

use super::Engine;

impl Engine {
    pub fn list_service_types(&self) -> Vec<ServiceType> {
        let mut out: Vec<ServiceType> = self
            .catalog
            .service_types
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get_service_type(&self, id: &Ulid) -> Option<ServiceType> {
        self.catalog.service_types.get(id).map(|e| e.value().clone())
    }

    pub fn list_rules(&self) -> Vec<RecurringRule> {
        let mut out: Vec<RecurringRule> = self
            .catalog
            .rules
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| (r.day_of_week, r.start_time, r.id));
        out
    }

    pub fn list_exclusions(&self) -> Vec<ExclusionDay> {
        let mut out: Vec<ExclusionDay> = self
            .catalog
            .exclusions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|x| x.date);
        out
    }

    /// Full ledger, newest day first, time ascending inside a day.
    pub async fn list_appointments(&self) -> Vec<Appointment> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<Appointment> = ledger.iter().cloned().collect();
        out.sort_by(|a, b| b.date.cmp(&a.date).then(a.time.cmp(&b.time)));
        out
    }

    pub async fn appointments_for_service_type(&self, id: &Ulid) -> Vec<Appointment> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<Appointment> = ledger
            .iter()
            .filter(|a| a.service_type_id == *id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date).then(a.time.cmp(&b.time)));
        out
    }

    /// Customer-facing status lookup. All three credentials must match:
    /// the appointment number exactly, the birth date exactly, and the
    /// name ignoring case.
    pub async fn appointment_status(
        &self,
        customer_name: &str,
        number: u32,
        birth_date: NaiveDate,
    ) -> Option<Appointment> {
        let ledger = self.ledger.read().await;
        ledger
            .get_by_number(number)
            .filter(|a| {
                a.customer_birth_date == birth_date
                    && a.customer_name.to_lowercase() == customer_name.to_lowercase()
            })
            .cloned()
    }
}
