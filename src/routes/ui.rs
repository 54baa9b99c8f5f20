use axum::{response::Html, routing::get, Router};

pub fn router() -> Router {
    Router::new().route("/", get(index))
}

async fn index() -> Html<&'static str> {
    Html(r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Research Chat</title>
  <style>
    body { font-family: Arial, sans-serif; margin: 2rem auto; max-width: 860px; color: #1d1d1f; }
    .card { border: 1px solid #ddd; padding: 1rem; border-radius: 8px; margin-bottom: 1rem; }
    textarea { width: 100%; min-height: 4rem; padding: 0.5rem; }
    button { margin-top: 0.5rem; padding: 0.6rem 1rem; }
    #progress { color: #666; font-size: 0.9rem; white-space: pre-wrap; }
    #answer { white-space: pre-wrap; }
    .msg { border-top: 1px solid #eee; padding: 0.5rem 0; white-space: pre-wrap; }
    .role { font-weight: 600; }
  </style>
</head>
<body>
  <h1>Research Chat</h1>

  <div class="card" id="history"></div>

  <div class="card">
    <textarea id="message" placeholder="Ask a question..."></textarea>
    <label><input id="deep" type="checkbox" /> Deep research</label>
    <label><input id="multi" type="checkbox" checked /> Multi-agent</label>
    <button id="send">Send</button>
    <button id="reset">New chat</button>
  </div>

  <div class="card">
    <div id="progress"></div>
    <div id="answer"></div>
  </div>

  <script>
    let conversationId = null;
    const history = document.getElementById('history');
    const progress = document.getElementById('progress');
    const answer = document.getElementById('answer');

    function addMessage(role, text) {
      const div = document.createElement('div');
      div.className = 'msg';
      div.innerHTML = '<span class="role"></span>: <span></span>';
      div.children[0].textContent = role;
      div.children[1].textContent = text;
      history.appendChild(div);
    }

    function handle(event) {
      switch (event.type) {
        case 'conversation_id': conversationId = event.conversation_id; break;
        case 'progress': progress.textContent = `[${event.progress}%] ${event.detail}`; break;
        case 'tool_call': progress.textContent += `\n-> ${event.tool}`; break;
        case 'response_chunk': answer.textContent += event.content; break;
        case 'response': answer.textContent = event.content; break;
        case 'error': progress.textContent = 'Error: ' + event.message; break;
        case 'done': addMessage('assistant', answer.textContent); answer.textContent = ''; break;
      }
    }

    document.getElementById('reset').addEventListener('click', () => {
      conversationId = null;
      history.innerHTML = '';
    });

    document.getElementById('send').addEventListener('click', async () => {
      const input = document.getElementById('message');
      const message = input.value.trim();
      if (!message) return;
      input.value = '';
      addMessage('user', message);
      answer.textContent = '';
      progress.textContent = 'Sending...';

      const res = await fetch('/api/chat', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify({
          message,
          conversation_id: conversationId,
          deep_research: document.getElementById('deep').checked,
          multi_agent: document.getElementById('multi').checked,
          stream: true,
          timezone: Intl.DateTimeFormat().resolvedOptions().timeZone
        })
      });
      if (!res.ok) {
        progress.textContent = 'Error: ' + (await res.text());
        return;
      }

      const reader = res.body.getReader();
      const decoder = new TextDecoder();
      let buffer = '';
      while (true) {
        const { value, done } = await reader.read();
        if (done) break;
        buffer += decoder.decode(value, { stream: true });
        const frames = buffer.split('\n\n');
        buffer = frames.pop();
        for (const frame of frames) {
          const data = frame.split('\n').filter(l => l.startsWith('data:')).map(l => l.slice(5).trim()).join('');
          if (data) handle(JSON.parse(data));
        }
      }
    });
  </script>
</body>
</html>"#)
}
