//! The client-side bridge script, injected into every page render.
//!
//! The script owns the browser half of the protocol: report interactions
//! upstream, apply `outerHTML` patches downstream, evaluate queued
//! scripts, append late statics to the head, and settle promises by
//! callback id. It prefers a WebSocket and falls back to SSE plus POST
//! automatically when the socket cannot be established.

pub const BRIDGE_JS: &str = r#"(function(){
    if (window.trellis) return;

    var pending = {};
    var nextCallback = 1;
    var ws = null;
    var es = null;
    var useFallback = false;
    var retryDelay = 100;
    var maxRetryDelay = 5000;

    function apply(msg) {
        if (msg.action === 'error') {
            console.error('[trellis] ' + msg.traceback);
            settle(msg.callback_id, msg.result, msg.traceback);
            return;
        }
        if (msg.statics) {
            msg.statics.forEach(function(fragment) {
                var holder = document.createElement('div');
                holder.innerHTML = fragment;
                Array.from(holder.children).forEach(function(el) {
                    document.head.appendChild(el);
                });
            });
        }
        if (msg.updates) {
            Object.keys(msg.updates).forEach(function(id) {
                var el = document.getElementById(id);
                if (el) {
                    el.outerHTML = msg.updates[id];
                } else {
                    console.warn('[trellis] no element for update: ' + id);
                }
            });
        }
        if (msg.js) {
            msg.js.forEach(function(script) {
                try { (0, eval)(script); }
                catch (e) { console.error('[trellis] js call failed', e); }
            });
        }
        settle(msg.callback_id, msg.result, null);
    }

    function settle(callbackId, result, errorText) {
        if (!callbackId || !pending[callbackId]) return;
        var entry = pending[callbackId];
        delete pending[callbackId];
        if (errorText) { entry.reject(new Error(errorText)); }
        else { entry.resolve(result); }
    }

    function payload(event, id, name, data) {
        var body = { id: id, event: name, data: data || {} };
        if (event && event.target) {
            if ('value' in event.target) body.data.value = String(event.target.value);
            if (event.key !== undefined) body.data.key = event.key;
        }
        return body;
    }

    function deliver(body) {
        if (!useFallback && ws && ws.readyState === WebSocket.OPEN) {
            ws.send(JSON.stringify(body));
            return;
        }
        fetch('/event', {
            method: 'POST',
            headers: { 'Content-Type': 'application/json' },
            body: JSON.stringify(body)
        }).catch(function(e) { console.error('[trellis] event post failed', e); });
    }

    function reconnect() {
        retryDelay = Math.min(retryDelay * 2, maxRetryDelay);
        setTimeout(connect, retryDelay);
    }

    function connect() {
        var protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
        try {
            ws = new WebSocket(protocol + '//' + window.location.host + '/ws');
        } catch (e) {
            connectFallback();
            return;
        }
        ws.onopen = function() {
            useFallback = false;
            retryDelay = 100;
        };
        ws.onmessage = function(event) { apply(JSON.parse(event.data)); };
        ws.onerror = function() {
            try { ws.close(); } catch (e) {}
            if (!useFallback) connectFallback();
        };
        ws.onclose = function() {
            if (!useFallback) reconnect();
        };
    }

    function connectFallback() {
        useFallback = true;
        if (es) return;
        es = new EventSource('/stream');
        es.onmessage = function(event) { apply(JSON.parse(event.data)); };
        es.onerror = function() {
            es.close();
            es = null;
            reconnect();
        };
    }

    window.trellis = {
        emit: function(event, id, name, data) {
            deliver(payload(event, id, name, data));
        },
        call: function(id, name, data) {
            return new Promise(function(resolve, reject) {
                var callbackId = 'cb' + (nextCallback++);
                pending[callbackId] = { resolve: resolve, reject: reject };
                var body = payload(null, id, name, data);
                body.data.callback_id = callbackId;
                deliver(body);
            });
        }
    };

    connect();
})();"#;
