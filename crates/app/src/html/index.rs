const SESSIONS_PLACEHOLDER: &str = "<!--SESSIONS-->";

pub const INDEX_HTML: &str = r#"
<!doctype html>
<html lang="en" class="h-full dark">

<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Smart Surveillance</title>
  <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
  <style type="text/tailwindcss">
    @theme {
      --color-console-bg: #050B16;
      --color-console-panel: #0A1628;
      --color-console-accent: #38bdf8;
      --color-console-fire: #fb923c;
      --color-console-weapon: #fb7185;
    }

    @layer base {
      body { @apply min-h-full bg-console-bg text-slate-100; }
      [x-cloak] { display: none !important; }
    }

    @layer components {
      .panel { @apply rounded-xl border border-slate-700/60 bg-console-panel p-4; }
      .btn { @apply rounded-md px-3 py-1.5 text-sm font-semibold transition hover:brightness-110; }
    }
  </style>
  <script defer src="https://cdn.jsdelivr.net/npm/alpinejs@3.13.5/dist/cdn.min.js" crossorigin="anonymous"></script>
</head>

<body x-data="surveillanceConsole()" x-init="init()">
  <main class="mx-auto grid max-w-6xl gap-4 p-6 lg:grid-cols-[2fr_1fr]">
    <section class="panel">
      <header class="mb-3 flex items-center justify-between">
        <h1 class="text-xl font-bold tracking-wide">Live feed</h1>
        <div class="flex gap-2">
          <button class="btn bg-emerald-600" @click="command('/start_camera')">Start</button>
          <button class="btn bg-rose-600" @click="command('/stop_camera')">Stop</button>
        </div>
      </header>
      <img src="/video_feed" alt="live feed" class="w-full rounded-lg bg-black" />
      <p class="mt-2 text-sm text-slate-400" x-text="status"></p>
      <div class="mt-3 flex gap-2">
        <a class="btn bg-sky-700" href="/download_alerts">Download alerts (CSV)</a>
        <a class="btn bg-sky-700" href="/download_video">Download latest video</a>
      </div>
    </section>

    <aside class="grid gap-4">
      <section class="panel">
        <h2 class="mb-2 text-lg font-semibold">Alerts</h2>
        <ul class="max-h-96 space-y-1 overflow-y-auto text-sm">
          <template x-for="alert in alerts.slice().reverse()" :key="alert.id">
            <li class="flex gap-2">
              <span class="text-slate-500" x-text="alert.timestamp"></span>
              <span :class="{
                'text-console-fire': alert.category === 'fire',
                'text-console-weapon': alert.category === 'weapon'
              }" x-text="alert.message"></span>
            </li>
          </template>
          <li x-show="alerts.length === 0" class="text-slate-500">No alerts yet</li>
        </ul>
      </section>

      <section class="panel">
        <h2 class="mb-2 text-lg font-semibold">Sessions</h2>
        <ul class="space-y-1 font-mono text-xs">
          <!--SESSIONS-->
        </ul>
      </section>
    </aside>
  </main>

  <script>
    function surveillanceConsole() {
      return {
        alerts: [],
        status: "",
        async init() {
          await this.refresh();
          setInterval(() => this.refresh(), 2000);
        },
        async refresh() {
          try {
            const res = await fetch("/alerts");
            if (res.ok) this.alerts = await res.json();
          } catch (_) {}
        },
        async command(path) {
          try {
            const res = await fetch(path);
            this.status = await res.text();
          } catch (err) {
            this.status = String(err);
          }
        },
      };
    }
  </script>
</body>

</html>
"#;

/// Fill the session list into [`INDEX_HTML`].
pub fn render_index<S: AsRef<str>>(sessions: &[S]) -> String {
    let items = if sessions.is_empty() {
        r#"<li class="text-slate-500">No sessions recorded yet</li>"#.to_string()
    } else {
        sessions
            .iter()
            .map(|name| format!("<li>{}</li>", escape(name.as_ref())))
            .collect::<Vec<_>>()
            .join("\n          ")
    };
    INDEX_HTML.replacen(SESSIONS_PLACEHOLDER, &items, 1)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_every_session() {
        let page = render_index(&["sessions/20250101_120000", "sessions/20250101_120500"]);
        assert!(page.contains("<li>sessions/20250101_120000</li>"));
        assert!(page.contains("<li>sessions/20250101_120500</li>"));
        assert!(!page.contains(SESSIONS_PLACEHOLDER));
    }

    #[test]
    fn empty_list_has_a_hint() {
        let page = render_index::<&str>(&[]);
        assert!(page.contains("No sessions recorded yet"));
    }

    #[test]
    fn names_are_escaped() {
        let page = render_index(&["<b>&\"x\""]);
        assert!(page.contains("<li>&lt;b&gt;&amp;&quot;x&quot;</li>"));
    }
}
