pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# SMSBATCH CONFIGURATION
# =============================================================================
# Batches of SMS records are picked up from the artifact store, rendered
# against stored templates and sent through the provider API within a daily
# sending window.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/smsbatch/config.yml
#   3. /etc/smsbatch/config.yml
#
# Any value may reference an environment variable as $env{...}.

# =============================================================================
# PROVIDER
# =============================================================================
provider:
  api_url: https://rest.nexmo.com/sms/json
  # Replace with real credentials or an environment reference
  api_key: changeme
  api_secret: changeme
  # Per-request timeout
  timeout: 30s

# =============================================================================
# DISPATCH
# =============================================================================
dispatch:
  # Maximum provider requests per second, retries included
  tps: 30
  # Attempts per message while the provider keeps throttling.
  # Leave unset to retry until the provider accepts or rejects the message.
  # max_throttle_retries: 20
  # Records rendered and in flight at once
  concurrency: 30

# =============================================================================
# SENDING WINDOW
# =============================================================================
# Messages are only sent on the listed days between start and end on a clock
# offset from UTC by utc_offset_minutes. A batch that does not fit into the
# time left is split; the unsent part waits for the next window.
window:
  # start: "08:00"
  end: "16:00"
  utc_offset_minutes: 60
  days: [Mon, Tue, Wed, Thu, Fri]
  # Share of the remaining time a split batch may use
  safety_factor: 0.9

# =============================================================================
# BATCHES
# =============================================================================
batches:
  delimiter: ";"
  # New batches are read from here
  pending_prefix: send/
  # Attempted records are archived here
  archive_prefix: processed/
  # Failed, summary and results CSVs are written here
  output_prefix: output/
  columns:
    template_id: ID_SMSTEXT
    phone: MOBILTELEFONNUMMER
    reference: ID

# =============================================================================
# RENDERING
# =============================================================================
rendering:
  # Placeholder naming a column the record lacks: blank, undefined or error
  missing_field: blank

# =============================================================================
# STORAGE
# =============================================================================
storage:
  # Root directory holding the pending/archive/output prefixes
  artifacts: ~/.local/share/smsbatch/artifacts
  # DuckDB file holding templates and checkpoint state
  state: ~/.local/share/smsbatch/state.db

# =============================================================================
# PROCESSING LOCK
# =============================================================================
lock:
  # A lease older than this is considered abandoned and taken over
  lease: 2h
  # How often a running cycle renews its lease
  keep_alive: 60s

# =============================================================================
# TRIGGER
# =============================================================================
trigger:
  # Six-field cron expression (seconds first), evaluated in UTC
  schedule: "0 0,30 * * * *"

# =============================================================================
# WEB SERVER
# =============================================================================
web:
  # Serves GET /_/health and POST /checkandsend
  listen: 127.0.0.1:3000
"#
    .to_string()
}
