//! Static session configuration
//!
//! Every session uses the same assistant script and function declaration;
//! only the credentials and a couple of device knobs come from the
//! environment.

use serde_json::json;

/// Name of the single function the assistant may call.
pub const REVIEW_BOOKING_DETAILS: &str = "reviewBookingDetails";

/// Sample rate of outbound (captured) audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound (synthesized) audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture window, ~256 ms at 16 kHz.
pub const CAPTURE_WINDOW: usize = 4096;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

const ASSISTANT_SCRIPT: &str = r#"You are Tony Quach & Co. CPA's AI Voice Support Assistant.

CORE RULES:
1. Use the "reviewBookingDetails" tool IMMEDIATELY upon collecting all 5 pieces of lead information. This is MANDATORY.
2. Do not invent information. Use provided business details.
3. Keep responses concise and professional.

BUSINESS INFO:
- Name: Tony Quach & Co. CPA
- Phone: (415) 771-1800 x3
- Services: Personal/Business Tax, Audit Rep, Incorporation, IRS Resolution.
- Philosophy: "You don't have to be a tax expert. That's our job."

LEAD QUALIFICATION SCRIPT (Execute strictly):
When a user wants to schedule or get help, ask these 5 questions one by one:
1. "First name?"
2. "Service type needed?" (e.g. Personal tax, Business tax, IRS problem, Audit, Incorporation)
3. "Business owner or individual?"
4. "Consultation this week or next?"
5. "Morning or afternoon preference?"

CRITICAL INSTRUCTION:
Once you have answers for ALL 5 questions, you MUST:
1. Call the "reviewBookingDetails" function with the collected data.
2. THEN, say: "Please review your details on the screen. If everything looks correct, click Confirm to submit your request."

Do not summarize verbally if you are calling the tool. Let the tool show the summary."#;

/// Response modality requested from the model. Only spoken replies are
/// played, so audio is the one modality offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
        }
    }
}

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub capture_window: usize,
    /// PulseAudio source to record from; `None` picks one automatically.
    pub pulse_source: Option<String>,
    /// Application name reported to PulseAudio.
    pub app_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: DEFAULT_MODEL.to_string(),
            response_modality: ResponseModality::Audio,
            system_instruction: ASSISTANT_SCRIPT.to_string(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            capture_window: CAPTURE_WINDOW,
            pulse_source: None,
            app_name: "voicedesk".to_string(),
        }
    }
}

/// Error raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {name} is not set: {source}")]
    MissingVar {
        name: &'static str,
        #[source]
        source: std::env::VarError,
    },
}

impl SessionConfig {
    /// Default configuration pointed at the Live API with the given key.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            ..Default::default()
        }
    }

    /// Build the configuration from `GEMINI_API_KEY` plus optional
    /// `VOICEDESK_MODEL` and `VOICEDESK_PULSE_SOURCE` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|source| ConfigError::MissingVar {
            name: "GEMINI_API_KEY",
            source,
        })?;
        let mut config = Self::from_api_key(&api_key);
        if let Ok(model) = std::env::var("VOICEDESK_MODEL") {
            config.model = model;
        }
        config.pulse_source = std::env::var("VOICEDESK_PULSE_SOURCE").ok();
        Ok(config)
    }

    /// The `tools` entry of the setup message.
    pub fn tools(&self) -> serde_json::Value {
        json!([{ "functionDeclarations": [review_booking_details_declaration()] }])
    }
}

/// Declaration of the booking review function offered to the assistant.
pub fn review_booking_details_declaration() -> serde_json::Value {
    json!({
        "name": REVIEW_BOOKING_DETAILS,
        "description": "Display a confirmation modal to the user with their booking details. Call this ONLY after collecting all 5 required pieces of information.",
        "parameters": {
            "type": "OBJECT",
            "properties": {
                "firstName": { "type": "STRING", "description": "The user's first name." },
                "serviceType": { "type": "STRING", "description": "The specific service requested (e.g., Personal Tax, Audit)." },
                "userType": { "type": "STRING", "description": "Business Owner or Individual Taxpayer." },
                "preferredDay": { "type": "STRING", "description": "Preferred timeframe (e.g., This Week, Next Week)." },
                "timePreference": { "type": "STRING", "description": "Preferred time of day (e.g., Morning, Afternoon)." }
            },
            "required": ["firstName", "serviceType", "userType", "preferredDay", "timePreference"]
        }
    })
}
