use crate::registry::OwnerId;

/// A validated task observation, ready to hand to the registry.
///
/// Construction is the only place owner ids are checked; the registry trusts
/// whatever it is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskObservation {
    owner_id: OwnerId,
    owner_name: String,
    payload: Vec<u8>,
}

impl TaskObservation {
    /// Returns `None` for non-positive owner ids.
    pub(crate) fn new(
        owner_id: OwnerId,
        owner_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Option<Self> {
        if owner_id <= 0 {
            return None;
        }
        Some(Self {
            owner_id,
            owner_name: owner_name.into(),
            payload,
        })
    }

    /// Observation keyed by model and upstream request id.
    ///
    /// Without a request id every call gets a unique payload, so each one
    /// occupies its own slot until evicted.
    pub(crate) fn from_request(
        owner_id: OwnerId,
        owner_name: impl Into<String>,
        model: &str,
        request_id: Option<&str>,
        now_nanos: i64,
    ) -> Option<Self> {
        let payload = match request_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => format!("{model}:{id}"),
            None => format!("{model}:{owner_id}:{now_nanos}"),
        };
        Self::new(owner_id, owner_name, payload.into_bytes())
    }

    pub(crate) fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub(crate) fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }
}
