//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "EskomSePush schedule provider."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ats_common::config::LoadSheddingConfig;
use ats_core::loadshed::{parse_stage_note, AreaSchedule, ScheduleDay, ScheduleEvent};
use ats_core::ports::ScheduleProvider;
use chrono::{DateTime, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct AreaResponse {
    #[serde(default)]
    events: Vec<EventDto>,
    schedule: ScheduleDto,
}

#[derive(Debug, Deserialize)]
struct EventDto {
    start: String,
    end: String,
    note: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleDto {
    #[serde(default)]
    days: Vec<DayDto>,
}

#[derive(Debug, Deserialize)]
struct DayDto {
    date: String,
    name: String,
    #[serde(default)]
    stages: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: StatusDto,
}

#[derive(Debug, Deserialize)]
struct StatusDto {
    eskom: StageDto,
}

#[derive(Debug, Deserialize)]
struct StageDto {
    stage: String,
}

impl AreaResponse {
    /// Event timestamps carry the area's UTC offset; the schedule works in that local time.
    fn into_schedule(self) -> Result<AreaSchedule> {
        let mut events = Vec::with_capacity(self.events.len());
        for event in self.events {
            let Some(stage) = parse_stage_note(&event.note) else {
                debug!(note = %event.note, "skipping event without a stage");
                continue;
            };
            let start = DateTime::parse_from_rfc3339(&event.start)
                .with_context(|| format!("invalid event start {}", event.start))?;
            let end = DateTime::parse_from_rfc3339(&event.end)
                .with_context(|| format!("invalid event end {}", event.end))?;
            events.push(ScheduleEvent {
                start: start.naive_local(),
                end: end.naive_local(),
                stage,
            });
        }

        let days = self
            .schedule
            .days
            .into_iter()
            .map(|day| {
                let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
                    .with_context(|| format!("invalid schedule date {}", day.date))?;
                Ok(ScheduleDay {
                    date,
                    name: day.name,
                    stages: day.stages,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AreaSchedule { events, days })
    }
}

/// Polls the EskomSePush business API for one area.
#[derive(Debug, Clone)]
pub struct EspScheduleProvider {
    client: reqwest::Client,
    base: String,
    token: String,
    area_id: String,
}

impl EspScheduleProvider {
    pub fn new(
        api_base: &str,
        token: impl Into<String>,
        area_id: impl Into<String>,
    ) -> Result<Self> {
        Url::parse(api_base).with_context(|| format!("invalid api base {}", api_base))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base: api_base.trim_end_matches('/').to_owned(),
            token: token.into(),
            area_id: area_id.into(),
        })
    }

    pub fn from_config(config: &LoadSheddingConfig) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .ok_or_else(|| anyhow!("load_shedding.api_token is not set"))?;
        let area = config
            .area_id
            .clone()
            .ok_or_else(|| anyhow!("load_shedding.area_id is not set"))?;
        info!(area = %area, base = %config.api_base, "schedule provider configured");
        Self::new(&config.api_base, token, area)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url.clone())
            .header("token", &self.token)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url.path()))?
            .error_for_status()
            .with_context(|| format!("{} rejected the request", url.path()))?;
        response
            .json()
            .await
            .with_context(|| format!("invalid response body from {}", url.path()))
    }
}

#[async_trait]
impl ScheduleProvider for EspScheduleProvider {
    async fn fetch_area_schedule(&self) -> Result<AreaSchedule> {
        let url = Url::parse_with_params(
            &format!("{}/area", self.base),
            &[("id", self.area_id.as_str())],
        )?;
        let response: AreaResponse = self.get(url).await?;
        response.into_schedule()
    }

    async fn fetch_current_stage(&self) -> Result<i32> {
        let url = Url::parse(&format!("{}/status", self.base))?;
        let response: StatusResponse = self.get(url).await?;
        let stage = response.status.eskom.stage;
        stage
            .trim()
            .parse()
            .with_context(|| format!("invalid stage {}", stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AREA_BODY: &str = r#"{
        "events": [
            {"end": "2024-05-02T16:30:00+02:00", "note": "Stage 4", "start": "2024-05-02T16:00:00+02:00"},
            {"end": "2024-05-02T17:00:00+02:00", "note": "Maintenance", "start": "2024-05-02T16:30:00+02:00"}
        ],
        "info": {"name": "Area 1", "region": "Somewhere"},
        "schedule": {
            "days": [
                {"date": "2024-05-02", "name": "Thursday", "stages": [[], ["18:00-20:30"], ["18:00-20:30", "02:00-04:30"]]}
            ],
            "source": "https://example.invalid"
        }
    }"#;

    #[test]
    fn area_response_maps_events_and_days() {
        let response: AreaResponse = serde_json::from_str(AREA_BODY).unwrap();
        let schedule = response.into_schedule().unwrap();

        assert_eq!(schedule.events.len(), 1);
        let event = &schedule.events[0];
        assert_eq!(event.stage, 4);
        assert_eq!(event.start.to_string(), "2024-05-02 16:00:00");
        assert_eq!(schedule.days[0].name, "Thursday");
        assert_eq!(schedule.days[0].stages[2].len(), 2);
    }

    #[test]
    fn bad_dates_are_rejected() {
        let body = r#"{"schedule": {"days": [{"date": "02/05/2024", "name": "x"}]}}"#;
        let response: AreaResponse = serde_json::from_str(body).unwrap();
        assert!(response.into_schedule().is_err());
    }

    #[test]
    fn base_url_must_parse() {
        assert!(EspScheduleProvider::new("not a url", "t", "a").is_err());
    }
}
